use candle_core::{DType, Device, Tensor};
use image::{RgbImage, imageops};
use tracing::instrument;

/// ImageNet statistics the backbone was trained with, RGB order.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Canvas sides are padded up to a multiple of the backbone's total stride.
const CANVAS_ALIGN: u32 = 32;

#[derive(Debug, Clone)]
pub struct Resized {
    /// The scaled image pasted at the top-left of a zero canvas.
    pub image: RgbImage,
    /// Scale applied to the original image.
    pub ratio: f64,
    /// Size of the score maps the network produces for this canvas.
    pub heatmap_size: (u32, u32),
}

/// Scales `image` by `mag_ratio`, keeping its longest side within
/// `canvas_size`, and pads the result to a multiple of 32 on both sides.
#[instrument(level = "debug", skip(image))]
pub fn resize_aspect_ratio(image: &RgbImage, canvas_size: u32, mag_ratio: f32) -> Resized {
    let (width, height) = image.dimensions();
    let longest = width.max(height) as f64;
    let target = (mag_ratio as f64 * longest).min(canvas_size as f64);
    let ratio = target / longest;

    let target_w = ((width as f64 * ratio) as u32).max(1);
    let target_h = ((height as f64 * ratio) as u32).max(1);
    let scaled = imageops::resize(image, target_w, target_h, imageops::FilterType::Triangle);

    let canvas_w = target_w.next_multiple_of(CANVAS_ALIGN);
    let canvas_h = target_h.next_multiple_of(CANVAS_ALIGN);
    let mut canvas = RgbImage::new(canvas_w, canvas_h);
    imageops::replace(&mut canvas, &scaled, 0, 0);
    tracing::debug!(target_w, target_h, canvas_w, canvas_h, ratio);

    Resized {
        image: canvas,
        ratio,
        heatmap_size: (canvas_w / 2, canvas_h / 2),
    }
}

/// Converts `image` into a normalized `(1, 3, h, w)` `f32` tensor.
#[instrument(level = "debug", skip_all)]
pub fn normalize_mean_variance(image: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
    let (width, height) = image.dimensions();
    let mean = Tensor::from_vec(MEAN.map(|m| m * 255.).to_vec(), (1, 3, 1, 1), device)?;
    let std = Tensor::from_vec(STD.map(|s| s * 255.).to_vec(), (1, 3, 1, 1), device)?;

    Tensor::from_vec(
        image.as_raw().clone(),
        (1, height as usize, width as usize, 3),
        device,
    )?
    .permute((0, 3, 1, 2))?
    .to_dtype(DType::F32)?
    .broadcast_sub(&mean)?
    .broadcast_div(&std)
}
