use std::ops::Range;

use candle_core::{ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Module};

use super::{batch_norm, conv2d};
use crate::error::Result;
use crate::loading::TensorSource;

/// torchvision `vgg16_bn` layout: output channels per 3x3 conv, `None` for a
/// 2x2 max pool.
const VGG16: &[Option<usize>] = &[
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    None,
];

/// Feature indices of `slice1..slice4`. Every slice ends on a BatchNorm, so
/// the exported features are taken before the ReLU.
const SLICES: [Range<usize>; 4] = [0..12, 12..19, 19..29, 29..39];

#[derive(Clone, Copy)]
enum Feature {
    Conv { in_channels: usize, out_channels: usize },
    BatchNorm(usize),
    Relu,
    MaxPool,
}

fn features() -> Vec<Feature> {
    let mut features = Vec::new();
    let mut in_channels = 3;
    for layer in VGG16 {
        match *layer {
            Some(out_channels) => {
                features.push(Feature::Conv {
                    in_channels,
                    out_channels,
                });
                features.push(Feature::BatchNorm(out_channels));
                features.push(Feature::Relu);
                in_channels = out_channels;
            }
            None => features.push(Feature::MaxPool),
        }
    }
    features
}

#[derive(Clone)]
enum Layer {
    Conv(Conv2d),
    BatchNorm(BatchNorm),
    Relu,
    MaxPool,
}

impl Module for Layer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Layer::Conv(conv) => conv.forward(xs),
            Layer::BatchNorm(bn) => bn.forward_t(xs, false),
            Layer::Relu => xs.relu(),
            Layer::MaxPool => xs.max_pool2d(2),
        }
    }
}

#[derive(Clone)]
struct Slice(Vec<Layer>);

impl Slice {
    fn load<S: TensorSource>(source: &mut S, index: usize, range: Range<usize>) -> Result<Self> {
        let features = features();
        let mut layers = Vec::with_capacity(range.len());
        for i in range {
            let prefix = format!("basenet.slice{index}.{i}");
            let layer = match features[i] {
                Feature::Conv {
                    in_channels,
                    out_channels,
                } => Layer::Conv(conv2d(
                    source,
                    &prefix,
                    in_channels,
                    out_channels,
                    3,
                    Conv2dConfig {
                        padding: 1,
                        ..Default::default()
                    },
                )?),
                Feature::BatchNorm(channels) => {
                    Layer::BatchNorm(batch_norm(source, &prefix, channels)?)
                }
                Feature::Relu => Layer::Relu,
                Feature::MaxPool => Layer::MaxPool,
            };
            layers.push(layer);
        }
        Ok(Self(layers))
    }
}

impl Module for Slice {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.0.iter().try_fold(xs.clone(), |xs, layer| layer.forward(&xs))
    }
}

/// Replacement for `fc6`/`fc7`: 3x3 stride-1 max pool, dilated 3x3 conv and a
/// 1x1 conv, all keeping the spatial size.
#[derive(Clone)]
struct Fc {
    fc6: Conv2d,
    fc7: Conv2d,
}

impl Fc {
    fn load<S: TensorSource>(source: &mut S) -> Result<Self> {
        let fc6 = conv2d(
            source,
            "basenet.slice5.1",
            512,
            1024,
            3,
            Conv2dConfig {
                padding: 6,
                dilation: 6,
                ..Default::default()
            },
        )?;
        let fc7 = conv2d(
            source,
            "basenet.slice5.2",
            1024,
            1024,
            1,
            Conv2dConfig::default(),
        )?;
        Ok(Self { fc6, fc7 })
    }
}

impl Module for Fc {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // edge replication keeps the max identical to -inf padding
        let xs = xs
            .pad_with_same(2, 1, 1)?
            .pad_with_same(3, 1, 1)?
            .max_pool2d_with_stride((3, 3), (1, 1))?;
        let xs = self.fc6.forward(&xs)?;
        self.fc7.forward(&xs)
    }
}

/// Backbone outputs, deepest first.
pub struct Sources {
    pub fc7: Tensor,
    pub conv5: Tensor,
    pub conv4: Tensor,
    pub conv3: Tensor,
    pub conv2: Tensor,
}

#[derive(Clone)]
pub struct Vgg16Bn {
    slices: [Slice; 4],
    fc: Fc,
}

impl Vgg16Bn {
    pub fn load<S: TensorSource>(source: &mut S) -> Result<Self> {
        let [s1, s2, s3, s4] = SLICES;
        let slices = [
            Slice::load(source, 1, s1)?,
            Slice::load(source, 2, s2)?,
            Slice::load(source, 3, s3)?,
            Slice::load(source, 4, s4)?,
        ];
        let fc = Fc::load(source)?;
        Ok(Self { slices, fc })
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Sources> {
        let conv2 = self.slices[0].forward(xs)?;
        let conv3 = self.slices[1].forward(&conv2)?;
        let conv4 = self.slices[2].forward(&conv3)?;
        let conv5 = self.slices[3].forward(&conv4)?;
        let fc7 = self.fc.forward(&conv5)?;
        Ok(Sources {
            fc7,
            conv5,
            conv4,
            conv3,
            conv2,
        })
    }
}
