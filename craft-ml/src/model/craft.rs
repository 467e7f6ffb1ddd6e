use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module};
use tracing::instrument;

use super::vgg16_bn::Vgg16Bn;
use super::{ConvBn, batch_norm, conv2d, upsample_bilinear};
use crate::error::Result;
use crate::loading::{StateDict, TensorSource};

/// `(in, mid, out)` channels of `upconv1..upconv4`. Each block sees its
/// upsampled input concatenated with the matching backbone feature, hence
/// `in + mid` input channels.
const UPCONVS: [(usize, usize, usize); 4] = [
    (1024, 512, 256),
    (512, 256, 128),
    (256, 128, 64),
    (128, 64, 32),
];

/// `conv_cls` layers as `(index, in, out, kernel)`; a ReLU follows all but
/// the last.
const CLASSIFIER: [(usize, usize, usize, usize); 5] = [
    (0, 32, 32, 3),
    (2, 32, 32, 3),
    (4, 32, 16, 3),
    (6, 16, 16, 1),
    (8, 16, 2, 1),
];

#[derive(Clone)]
struct DoubleConv {
    reduce: ConvBn,
    conv: ConvBn,
}

impl DoubleConv {
    fn load<S: TensorSource>(
        source: &mut S,
        prefix: &str,
        (in_channels, mid_channels, out_channels): (usize, usize, usize),
    ) -> Result<Self> {
        let reduce = ConvBn {
            conv: conv2d(
                source,
                &format!("{prefix}.conv.0"),
                in_channels + mid_channels,
                mid_channels,
                1,
                Conv2dConfig::default(),
            )?,
            bn: batch_norm(source, &format!("{prefix}.conv.1"), mid_channels)?,
        };
        let conv = ConvBn {
            conv: conv2d(
                source,
                &format!("{prefix}.conv.3"),
                mid_channels,
                out_channels,
                3,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
            )?,
            bn: batch_norm(source, &format!("{prefix}.conv.4"), out_channels)?,
        };
        Ok(Self { reduce, conv })
    }
}

impl Module for DoubleConv {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.reduce.forward(xs)?.relu()?;
        self.conv.forward(&xs)?.relu()
    }
}

/// The CRAFT text detector network in inference mode.
#[derive(Clone)]
pub struct Craft {
    basenet: Vgg16Bn,
    upconvs: [DoubleConv; 4],
    classifier: Vec<Conv2d>,
}

impl Craft {
    /// Builds the network, taking every parameter from `source`.
    pub fn load<S: TensorSource>(source: &mut S) -> Result<Self> {
        let basenet = Vgg16Bn::load(source)?;
        let [u1, u2, u3, u4] = UPCONVS;
        let upconvs = [
            DoubleConv::load(source, "upconv1", u1)?,
            DoubleConv::load(source, "upconv2", u2)?,
            DoubleConv::load(source, "upconv3", u3)?,
            DoubleConv::load(source, "upconv4", u4)?,
        ];
        let classifier = CLASSIFIER
            .iter()
            .map(|&(index, in_channels, out_channels, kernel)| {
                conv2d(
                    source,
                    &format!("conv_cls.{index}"),
                    in_channels,
                    out_channels,
                    kernel,
                    Conv2dConfig {
                        padding: kernel / 2,
                        ..Default::default()
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            basenet,
            upconvs,
            classifier,
        })
    }

    /// Builds the network from a checkpoint, stripping the data-parallel key
    /// prefix and rejecting tensors the network does not use.
    pub fn from_state_dict(state: StateDict) -> Result<Self> {
        let mut state = state.strip_parallel_prefix()?;
        let model = Self::load(&mut state)?;
        state.finish()?;
        Ok(model)
    }

    /// Runs the network on a `(batch, 3, h, w)` image tensor with `h` and `w`
    /// multiples of 32. Returns `(batch, h / 2, w / 2, 2)` scores: channel 0
    /// is the region score, channel 1 the affinity (link) score.
    #[instrument(level = "debug", skip_all)]
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let sources = self.basenet.forward(xs)?;

        let ys = Tensor::cat(&[&sources.fc7, &sources.conv5], 1)?;
        let mut ys = self.upconvs[0].forward(&ys)?;
        for (upconv, skip) in self.upconvs[1..]
            .iter()
            .zip([&sources.conv4, &sources.conv3, &sources.conv2])
        {
            let (_, _, h, w) = skip.dims4()?;
            ys = upsample_bilinear(&ys, h, w)?;
            ys = upconv.forward(&Tensor::cat(&[&ys, skip], 1)?)?;
        }

        let last = self.classifier.len() - 1;
        for (i, conv) in self.classifier.iter().enumerate() {
            ys = conv.forward(&ys)?;
            if i < last {
                ys = ys.relu()?;
            }
        }

        ys.permute((0, 2, 3, 1))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device};

    use super::*;
    use crate::error::WeightsError;

    /// Random parameters, recorded so they can be replayed as a checkpoint.
    #[derive(Default)]
    struct RandomSource {
        tensors: HashMap<String, Tensor>,
    }

    impl TensorSource for RandomSource {
        fn tensor(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
            let tensor = if name.ends_with("running_var") {
                Tensor::ones(shape, DType::F32, &Device::Cpu)?
            } else {
                Tensor::randn(0f32, 0.05, shape, &Device::Cpu)?
            };
            self.tensors.insert(name.to_string(), tensor.clone());
            Ok(tensor)
        }
    }

    fn random_checkpoint() -> Result<(Craft, HashMap<String, Tensor>)> {
        let mut source = RandomSource::default();
        let model = Craft::load(&mut source)?;
        Ok((model, source.tensors))
    }

    #[test]
    fn forward_halves_resolution() -> anyhow::Result<()> {
        let (model, _) = random_checkpoint()?;
        let xs = Tensor::randn(0f32, 1., (1, 3, 64, 96), &Device::Cpu)?;

        let ys = model.forward(&xs)?;
        assert_eq!(ys.dims(), &[1, 32, 48, 2]);
        Ok(())
    }

    #[test]
    fn checkpoint_uses_reference_key_names() -> anyhow::Result<()> {
        let (_, tensors) = random_checkpoint()?;

        for key in [
            "basenet.slice1.0.weight",
            "basenet.slice1.1.running_var",
            "basenet.slice4.38.bias",
            "basenet.slice5.1.weight",
            "basenet.slice5.2.bias",
            "upconv1.conv.0.weight",
            "upconv4.conv.4.running_mean",
            "conv_cls.8.weight",
        ] {
            assert!(tensors.contains_key(key), "{key}");
        }
        assert_eq!(tensors["upconv1.conv.0.weight"].dims(), &[512, 1536, 1, 1]);
        assert_eq!(tensors["basenet.slice5.1.weight"].dims(), &[1024, 512, 3, 3]);
        Ok(())
    }

    #[test]
    fn from_state_dict_accepts_parallel_checkpoint() -> anyhow::Result<()> {
        let (_, tensors) = random_checkpoint()?;
        let mut prefixed: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(key, tensor)| (format!("module.{key}"), tensor))
            .collect();
        prefixed.insert(
            "module.basenet.slice1.1.num_batches_tracked".to_string(),
            Tensor::zeros((), DType::F32, &Device::Cpu)?,
        );

        Craft::from_state_dict(StateDict::new(prefixed))?;
        Ok(())
    }

    #[test]
    fn from_state_dict_rejects_schema_mismatch() -> anyhow::Result<()> {
        let (_, mut tensors) = random_checkpoint()?;
        tensors.insert(
            "conv_cls.8.weight".to_string(),
            Tensor::zeros((3, 16, 1, 1), DType::F32, &Device::Cpu)?,
        );
        assert!(matches!(
            Craft::from_state_dict(StateDict::new(tensors.clone())),
            Err(WeightsError::ShapeMismatch { ref name, .. }) if name == "conv_cls.8.weight"
        ));

        tensors.insert(
            "conv_cls.8.weight".to_string(),
            Tensor::zeros((2, 16, 1, 1), DType::F32, &Device::Cpu)?,
        );
        tensors.insert(
            "conv_cls.10.weight".to_string(),
            Tensor::zeros((2, 2, 1, 1), DType::F32, &Device::Cpu)?,
        );
        assert!(matches!(
            Craft::from_state_dict(StateDict::new(tensors.clone())),
            Err(WeightsError::UnexpectedTensors(_))
        ));

        tensors.remove("conv_cls.10.weight");
        tensors.remove("upconv2.conv.1.bias");
        assert!(matches!(
            Craft::from_state_dict(StateDict::new(tensors)),
            Err(WeightsError::MissingTensor(ref name)) if name == "upconv2.conv.1.bias"
        ));
        Ok(())
    }
}
