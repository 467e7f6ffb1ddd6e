//! CRAFT network: a VGG16-BN backbone with a U-shaped upsampling head.
//!
//! Character Region Awareness for Text Detection
//! <https://arxiv.org/abs/1904.01941>
mod craft;
mod vgg16_bn;

use candle_core::{Device, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Module};

use crate::error::Result;
use crate::loading::TensorSource;

pub use craft::Craft;

const BATCH_NORM_EPS: f64 = 1e-5;

fn conv2d<S: TensorSource>(
    source: &mut S,
    prefix: &str,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    config: Conv2dConfig,
) -> Result<Conv2d> {
    let weight = source.tensor(
        &format!("{prefix}.weight"),
        &[out_channels, in_channels, kernel, kernel],
    )?;
    let bias = source.tensor(&format!("{prefix}.bias"), &[out_channels])?;
    Ok(Conv2d::new(weight, Some(bias), config))
}

fn batch_norm<S: TensorSource>(source: &mut S, prefix: &str, channels: usize) -> Result<BatchNorm> {
    let weight = source.tensor(&format!("{prefix}.weight"), &[channels])?;
    let bias = source.tensor(&format!("{prefix}.bias"), &[channels])?;
    let running_mean = source.tensor(&format!("{prefix}.running_mean"), &[channels])?;
    let running_var = source.tensor(&format!("{prefix}.running_var"), &[channels])?;
    Ok(BatchNorm::new(
        channels,
        running_mean,
        running_var,
        weight,
        bias,
        BATCH_NORM_EPS,
    )?)
}

#[derive(Clone)]
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl Module for ConvBn {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        self.bn.forward_t(&xs, false)
    }
}

/// Bilinear resize of an NCHW tensor with `align_corners = false`, done as
/// one interpolation matmul per spatial axis.
pub fn upsample_bilinear(xs: &Tensor, height: usize, width: usize) -> candle_core::Result<Tensor> {
    let (_, _, in_h, in_w) = xs.dims4()?;
    if (in_h, in_w) == (height, width) {
        return Ok(xs.clone());
    }

    let rows = interpolation_matrix(in_h, height, xs.device())?;
    let cols = interpolation_matrix(in_w, width, xs.device())?
        .t()?
        .contiguous()?;
    let xs = xs.contiguous()?.broadcast_matmul(&cols)?;
    rows.broadcast_matmul(&xs)
}

/// `(output, input)` weights mapping `input` samples onto `output` samples.
fn interpolation_matrix(
    input: usize,
    output: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let scale = input as f32 / output as f32;
    let mut weights = vec![0f32; output * input];
    for (o, row) in weights.chunks_exact_mut(input).enumerate() {
        let src = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(input - 1);
        let i1 = (i0 + 1).min(input - 1);
        let frac = src - i0 as f32;
        row[i0] += 1.0 - frac;
        row[i1] += frac;
    }
    Tensor::from_vec(weights, (output, input), device)
}
