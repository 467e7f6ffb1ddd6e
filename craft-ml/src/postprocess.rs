use std::collections::BTreeMap;

use anyhow::ensure;
use candle_core::Tensor;
use image::{GrayImage, Luma, imageops};
use imageproc::geometry::min_area_rect;
use imageproc::morphology::{Mask, grayscale_dilate};
use imageproc::point::Point;
use imageproc::region_labelling::{Connectivity, connected_components};
use tracing::instrument;

/// A box as four corners, clockwise from the corner nearest the origin.
pub type Quad = [Point<f32>; 4];

/// Components smaller than this many score-map pixels are noise.
const MIN_COMPONENT_AREA: u32 = 10;

/// Boxes whose sides differ by at most this ratio are treated as squares and
/// replaced by their axis-aligned bounds.
const SQUARE_TOLERANCE: f32 = 0.1;

/// Largest side a morphology mask can have.
const MAX_KERNEL_SIDE: u32 = 511;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Minimum peak region score for a component to count as text.
    pub text: f32,
    /// Affinity score above which a pixel links neighbouring characters.
    pub link: f32,
    /// Region score above which a pixel belongs to a character.
    pub low_text: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            text: 0.7,
            link: 0.4,
            low_text: 0.4,
        }
    }
}

/// A single-channel score map in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ScoreMap {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> anyhow::Result<Self> {
        ensure!(
            data.len() == width as usize * height as usize,
            "score map of {width}x{height} needs {} values, got {}",
            width as usize * height as usize,
            data.len()
        );
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Copies a `(height, width)` tensor off the device.
    pub fn from_tensor(tensor: &Tensor) -> candle_core::Result<Self> {
        let (height, width) = tensor.dims2()?;
        let data = tensor.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            width: width as u32,
            height: height as u32,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[self.index(x, y)]
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Scores in `[0, 1]` mapped to 8-bit intensity.
    pub fn to_heatmap(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y).clamp(0., 1.) * 255.).round() as u8])
        })
    }
}

/// Region and link heat maps side by side.
pub fn render_heatmap(text: &ScoreMap, link: &ScoreMap) -> GrayImage {
    let mut canvas = GrayImage::new(text.width + link.width, text.height.max(link.height));
    imageops::replace(&mut canvas, &text.to_heatmap(), 0, 0);
    imageops::replace(&mut canvas, &link.to_heatmap(), text.width as i64, 0);
    canvas
}

#[derive(Debug, Clone, Copy)]
struct Component {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
    area: u32,
    peak: f32,
}

impl Component {
    fn new(x: u32, y: u32, score: f32) -> Self {
        Self {
            left: x,
            top: y,
            right: x,
            bottom: y,
            area: 1,
            peak: score,
        }
    }

    fn extend(&mut self, x: u32, y: u32, score: f32) {
        self.left = self.left.min(x);
        self.top = self.top.min(y);
        self.right = self.right.max(x);
        self.bottom = self.bottom.max(y);
        self.area += 1;
        self.peak = self.peak.max(score);
    }

    fn width(&self) -> u32 {
        self.right - self.left + 1
    }

    fn height(&self) -> u32 {
        self.bottom - self.top + 1
    }
}

/// Decodes region and link score maps into word boxes, in score-map pixels.
#[instrument(level = "debug", skip_all)]
pub fn det_boxes(
    text: &ScoreMap,
    link: &ScoreMap,
    thresholds: &Thresholds,
) -> anyhow::Result<Vec<Quad>> {
    ensure!(
        (text.width, text.height) == (link.width, link.height),
        "region map is {}x{} but link map is {}x{}",
        text.width,
        text.height,
        link.width,
        link.height
    );

    let text_mask: Vec<bool> = text.data.iter().map(|&s| s > thresholds.low_text).collect();
    let link_mask: Vec<bool> = link.data.iter().map(|&s| s > thresholds.link).collect();
    let combined = GrayImage::from_fn(text.width, text.height, |x, y| {
        let i = text.index(x, y);
        Luma([if text_mask[i] || link_mask[i] { 255 } else { 0 }])
    });
    let labels = connected_components(&combined, Connectivity::Four, Luma([0u8]));

    let mut components: BTreeMap<u32, Component> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        let score = text.get(x, y);
        components
            .entry(label)
            .and_modify(|c| c.extend(x, y, score))
            .or_insert_with(|| Component::new(x, y, score));
    }

    let boxes: Vec<Quad> = components
        .into_iter()
        .filter(|(_, c)| c.area >= MIN_COMPONENT_AREA && c.peak >= thresholds.text)
        .filter_map(|(label, c)| {
            let points = component_points(&labels, label, &c, &text_mask, &link_mask);
            (!points.is_empty()).then(|| fit_box(&points))
        })
        .collect();
    tracing::debug!(boxes = boxes.len());

    Ok(boxes)
}

/// Pixels of one component without its link-only pixels, dilated in
/// proportion to how densely the component fills its bounding box.
fn component_points(
    labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>,
    label: u32,
    component: &Component,
    text_mask: &[bool],
    link_mask: &[bool],
) -> Vec<Point<i32>> {
    let (map_w, map_h) = labels.dimensions();
    let (w, h) = (component.width(), component.height());
    let niter = ((component.area as f64 * w.min(h) as f64 / (w as f64 * h as f64)).sqrt() * 2.0)
        as u32;

    let sx = component.left.saturating_sub(niter);
    let sy = component.top.saturating_sub(niter);
    let ex = (component.left + w + niter + 1).min(map_w);
    let ey = (component.top + h + niter + 1).min(map_h);

    let mut segment = GrayImage::new(ex - sx, ey - sy);
    for y in sy..ey {
        for x in sx..ex {
            let i = y as usize * map_w as usize + x as usize;
            let link_only = link_mask[i] && !text_mask[i];
            if labels.get_pixel(x, y)[0] == label && !link_only {
                segment.put_pixel(x - sx, y - sy, Luma([255]));
            }
        }
    }

    // square kernel of side `1 + niter` anchored at `side / 2`; even sides
    // grow the component one pixel more to the right and bottom
    let side = (1 + niter).min(MAX_KERNEL_SIDE);
    if side > 1 {
        let anchor = (side / 2) as u8;
        let square = GrayImage::from_pixel(side, side, Luma([255]));
        segment = grayscale_dilate(&segment, &Mask::from_image(&square, anchor, anchor));
    }

    segment
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .map(|(x, y, _)| Point::new((x + sx) as i32, (y + sy) as i32))
        .collect()
}

fn fit_box(points: &[Point<i32>]) -> Quad {
    let mut quad = if points.len() >= 3 {
        min_area_rect(points).map(|p| Point::new(p.x as f32, p.y as f32))
    } else {
        bounding_quad(points)
    };

    let side_a = distance(quad[0], quad[1]);
    let side_b = distance(quad[1], quad[2]);
    let box_ratio = side_a.max(side_b) / (side_a.min(side_b) + 1e-5);
    if (1. - box_ratio).abs() <= SQUARE_TOLERANCE {
        quad = bounding_quad(points);
    }

    let start = quad
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (a.x + a.y).total_cmp(&(b.x + b.y)))
        .map_or(0, |(i, _)| i);
    quad.rotate_left(start);
    quad
}

fn bounding_quad(points: &[Point<i32>]) -> Quad {
    let left = points.iter().map(|p| p.x).min().unwrap_or(0) as f32;
    let right = points.iter().map(|p| p.x).max().unwrap_or(0) as f32;
    let top = points.iter().map(|p| p.y).min().unwrap_or(0) as f32;
    let bottom = points.iter().map(|p| p.y).max().unwrap_or(0) as f32;
    [
        Point::new(left, top),
        Point::new(right, top),
        Point::new(right, bottom),
        Point::new(left, bottom),
    ]
}

fn distance(a: Point<f32>, b: Point<f32>) -> f32 {
    (a.x - b.x).hypot(a.y - b.y)
}

/// Maps boxes from score-map pixels back to image pixels. `ratio_net` is the
/// network's downsampling factor.
pub fn adjust_result_coordinates(
    boxes: Vec<Quad>,
    ratio_w: f64,
    ratio_h: f64,
    ratio_net: f64,
) -> Vec<Quad> {
    let scale_x = (ratio_w * ratio_net) as f32;
    let scale_y = (ratio_h * ratio_net) as f32;
    boxes
        .into_iter()
        .map(|quad| quad.map(|p| Point::new(p.x * scale_x, p.y * scale_y)))
        .collect()
}
