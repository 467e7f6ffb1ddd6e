use image::{Rgb, RgbImage, imageops};
use imageproc::drawing::draw_line_segment_mut;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

/// Axis-aligned text region in original image pixels. Always satisfies
/// `min_x <= max_x <= width` and `min_y <= max_y <= height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRegion {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TextRegion {
    /// Bounds of `polygon` grown by `padding` on every side and clamped to a
    /// `width` x `height` image. Returns `None` for an empty polygon.
    pub fn from_polygon(
        polygon: &[Point<i32>],
        padding: u32,
        width: u32,
        height: u32,
    ) -> Option<Self> {
        let min_x = polygon.iter().map(|p| p.x).min()?;
        let max_x = polygon.iter().map(|p| p.x).max()?;
        let min_y = polygon.iter().map(|p| p.y).min()?;
        let max_y = polygon.iter().map(|p| p.y).max()?;

        let padding = padding as i64;
        let clamp = |value: i64, limit: u32| value.clamp(0, limit as i64) as u32;
        Some(Self {
            min_x: clamp(min_x as i64 - padding, width),
            min_y: clamp(min_y as i64 - padding, height),
            max_x: clamp(max_x as i64 + padding, width),
            max_y: clamp(max_y as i64 + padding, height),
        })
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// `[min_x, min_y, max_x, max_y]`
    pub fn to_array(&self) -> [u32; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    /// Copies the pixels this region covers out of `image`.
    pub fn crop(&self, image: &RgbImage) -> RgbImage {
        imageops::crop_imm(image, self.min_x, self.min_y, self.width(), self.height()).to_image()
    }
}

/// Draws the closed outline of `polygon`, `thickness` pixels wide.
pub fn draw_polygon(canvas: &mut RgbImage, polygon: &[Point<i32>], color: Rgb<u8>, thickness: u32) {
    for (i, start) in polygon.iter().enumerate() {
        let end = polygon[(i + 1) % polygon.len()];
        for t in 0..thickness {
            let offset = t as f32;
            let (x0, y0, x1, y1) = (start.x as f32, start.y as f32, end.x as f32, end.y as f32);
            draw_line_segment_mut(canvas, (x0 + offset, y0), (x1 + offset, y1), color);
            draw_line_segment_mut(canvas, (x0, y0 + offset), (x1, y1 + offset), color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: i32, y0: i32, x1: i32, y1: i32) -> Vec<Point<i32>> {
        vec![
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ]
    }

    #[test]
    fn pads_inside_the_image() {
        let region = TextRegion::from_polygon(&square(20, 30, 40, 50), 5, 100, 100).unwrap();
        assert_eq!(region.to_array(), [15, 25, 45, 55]);
        assert_eq!((region.width(), region.height()), (30, 30));
    }

    #[test]
    fn clamps_to_image_bounds() {
        for polygon in [
            square(-20, -10, 3, 2),
            square(90, 95, 130, 140),
            square(-50, -50, -30, -30),
            square(150, 160, 170, 180),
            square(-10, 40, 120, 60),
        ] {
            let region = TextRegion::from_polygon(&polygon, 5, 100, 80).unwrap();
            assert!(region.min_x <= region.max_x && region.max_x <= 100, "{region:?}");
            assert!(region.min_y <= region.max_y && region.max_y <= 80, "{region:?}");
        }

        let region = TextRegion::from_polygon(&square(90, 70, 130, 140), 5, 100, 80).unwrap();
        assert_eq!(region.to_array(), [85, 65, 100, 80]);
    }

    #[test]
    fn empty_polygon_has_no_region() {
        assert_eq!(TextRegion::from_polygon(&[], 5, 10, 10), None);
    }

    #[test]
    fn crop_copies_region_pixels() {
        let mut image = RgbImage::new(10, 10);
        image.put_pixel(3, 4, Rgb([1, 2, 3]));
        let region = TextRegion {
            min_x: 3,
            min_y: 4,
            max_x: 6,
            max_y: 9,
        };

        let crop = region.crop(&image);
        assert_eq!(crop.dimensions(), (3, 5));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn outline_is_drawn_on_polygon_edges_only() {
        let mut canvas = RgbImage::new(20, 20);
        let red = Rgb([255, 0, 0]);
        draw_polygon(&mut canvas, &square(4, 4, 15, 15), red, 2);

        assert_eq!(canvas.get_pixel(4, 10), &red);
        assert_eq!(canvas.get_pixel(5, 10), &red);
        assert_eq!(canvas.get_pixel(10, 15), &red);
        assert_eq!(canvas.get_pixel(10, 10), &Rgb([0, 0, 0]));
        assert_eq!(canvas.get_pixel(1, 1), &Rgb([0, 0, 0]));
    }
}
