use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use candle_core::{Device, IndexOp, Tensor};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::point::Point;
use tracing::instrument;

use crate::config::DetectorConfig;
use crate::imgproc::{normalize_mean_variance, resize_aspect_ratio};
use crate::loading::StateDict;
use crate::model::Craft;
use crate::postprocess::{ScoreMap, adjust_result_coordinates, det_boxes, render_heatmap};
use crate::region::{TextRegion, draw_polygon};

/// Score maps come out at half the input resolution.
const NET_RATIO: f64 = 2.0;
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;

#[derive(Debug, Clone)]
pub struct Detection {
    /// Copy of the input with every detected box outlined.
    pub visualization: RgbImage,
    /// Padded regions, in detection order.
    pub regions: Vec<TextRegion>,
    /// Wall-clock time of the whole call.
    pub elapsed: Duration,
    /// Region and link score maps side by side.
    pub heatmap: GrayImage,
}

impl Detection {
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

pub struct CraftDetector {
    model: Craft,
    config: DetectorConfig,
    device: Device,
}

impl CraftDetector {
    /// Loads a checkpoint onto `device`. The network stays fixed for the
    /// lifetime of the detector.
    pub fn load(weights: impl AsRef<Path>, config: DetectorConfig, device: Device) -> Result<Self> {
        let weights = weights.as_ref();
        let state = StateDict::load(weights, &device)
            .with_context(|| format!("failed to load {}", weights.display()))?;
        let model = Craft::from_state_dict(state)
            .with_context(|| format!("{} does not match the CRAFT network", weights.display()))?;
        tracing::info!(weights = %weights.display(), device = ?device.location(), "CRAFT loaded");

        Self::new(model, config, device)
    }

    pub fn new(model: Craft, config: DetectorConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            config,
            device,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Finds text regions in `image`, which must be in RGB channel order.
    /// Buffers decoded as BGR (e.g. by OpenCV) need their channels swapped
    /// first, otherwise the normalization constants apply to the wrong
    /// channels.
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    pub fn detect(&self, image: &RgbImage) -> Result<Detection> {
        let start = Instant::now();
        let (width, height) = image.dimensions();
        ensure!(width > 0 && height > 0, "cannot detect text in an empty image");

        let resized = resize_aspect_ratio(image, self.config.canvas_size, self.config.mag_ratio);
        let input = normalize_mean_variance(&resized.image, &self.device)?;
        let (text, link) = self.forward(&input)?;

        let boxes = det_boxes(&text, &link, &self.config.thresholds())?;
        let scale = 1.0 / resized.ratio;
        let boxes = adjust_result_coordinates(boxes, scale, scale, NET_RATIO);

        let mut visualization = image.clone();
        let mut regions = Vec::with_capacity(boxes.len());
        for quad in &boxes {
            let polygon: Vec<Point<i32>> = quad
                .iter()
                .map(|p| Point::new(p.x as i32, p.y as i32))
                .collect();
            if let Some(region) =
                TextRegion::from_polygon(&polygon, self.config.padding, width, height)
            {
                regions.push(region);
            }
            draw_polygon(&mut visualization, &polygon, BOX_COLOR, BOX_THICKNESS);
        }
        tracing::debug!(regions = regions.len());

        Ok(Detection {
            visualization,
            regions,
            elapsed: start.elapsed(),
            heatmap: render_heatmap(&text, &link),
        })
    }

    #[instrument(level = "debug", skip_all)]
    fn forward(&self, input: &Tensor) -> Result<(ScoreMap, ScoreMap)> {
        let scores = self.model.forward(input)?;
        let text = ScoreMap::from_tensor(&scores.i((0, .., .., 0))?)?;
        let link = ScoreMap::from_tensor(&scores.i((0, .., .., 1))?)?;
        Ok((text, link))
    }
}
