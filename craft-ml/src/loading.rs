use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::instrument;

use crate::error::{Result, WeightsError};

/// First key segment added by data-parallel training wrappers.
pub const PARALLEL_PREFIX: &str = "module";

/// Tensor counters that checkpoints carry but inference never reads.
const IGNORED_SUFFIXES: &[&str] = &["num_batches_tracked"];

/// Hands out named parameters while a network is being built.
pub trait TensorSource {
    /// Takes the tensor stored under `name`, which must have exactly `shape`.
    fn tensor(&mut self, name: &str, shape: &[usize]) -> Result<Tensor>;
}

/// A checkpoint's parameters keyed by name.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
}

impl StateDict {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Reads a `.safetensors` or PyTorch pickle checkpoint and moves every
    /// tensor to `device` as `f32`.
    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        std::fs::metadata(path)?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let tensors: Vec<(String, Tensor)> = match extension.as_deref() {
            Some("safetensors") => candle_core::safetensors::load(path, &Device::Cpu)?
                .into_iter()
                .collect(),
            Some("pth" | "pt" | "bin" | "ckpt") => candle_core::pickle::read_all(path)?,
            _ => return Err(WeightsError::UnsupportedFormat(path.to_path_buf())),
        };

        let tensors = tensors
            .into_iter()
            .map(|(name, tensor)| -> Result<(String, Tensor)> {
                Ok((name, tensor.to_dtype(DType::F32)?.to_device(device)?))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        tracing::info!(tensors = tensors.len(), "loaded checkpoint");

        Ok(Self { tensors })
    }

    /// Removes the data-parallel `module.` prefix from every key.
    ///
    /// Whether the checkpoint is prefixed is decided from its first key; every
    /// other key must then agree, otherwise the checkpoint is rejected.
    pub fn strip_parallel_prefix(self) -> Result<Self> {
        let prefixed = self
            .tensors
            .keys()
            .min()
            .and_then(|key| key.split_once('.'))
            .is_some_and(|(head, _)| head == PARALLEL_PREFIX);
        if !prefixed {
            return Ok(self);
        }

        let tensors = self
            .tensors
            .into_iter()
            .map(|(key, tensor)| {
                let stripped = key
                    .split_once('.')
                    .filter(|(head, _)| *head == PARALLEL_PREFIX)
                    .map(|(_, rest)| rest.to_string());
                match stripped {
                    Some(name) => Ok((name, tensor)),
                    None => Err(WeightsError::InconsistentPrefix {
                        prefix: PARALLEL_PREFIX.to_string(),
                        key,
                    }),
                }
            })
            .collect::<Result<HashMap<_, _>>>()?;

        tracing::debug!("stripped `{PARALLEL_PREFIX}.` prefix from checkpoint keys");
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Parameter names in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Fails if tensors the network never asked for are left over.
    pub fn finish(self) -> Result<()> {
        let mut unexpected: Vec<String> = self
            .tensors
            .into_keys()
            .filter(|key| !IGNORED_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)))
            .collect();
        if unexpected.is_empty() {
            return Ok(());
        }
        unexpected.sort_unstable();
        Err(WeightsError::UnexpectedTensors(unexpected))
    }
}

impl TensorSource for StateDict {
    fn tensor(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| WeightsError::MissingTensor(name.to_string()))?;
        if tensor.dims() != shape {
            return Err(WeightsError::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensors(names: &[&str]) -> anyhow::Result<HashMap<String, Tensor>> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| -> anyhow::Result<(String, Tensor)> {
                let tensor = Tensor::new(&[i as f32, i as f32 + 0.5], &Device::Cpu)?;
                Ok((name.to_string(), tensor))
            })
            .collect()
    }

    #[test]
    fn prefixed_checkpoint_matches_plain_one() -> anyhow::Result<()> {
        let plain = StateDict::new(tensors(&["basenet.slice1.0.weight", "conv_cls.8.bias"])?)
            .strip_parallel_prefix()?;
        let prefixed = StateDict::new(tensors(&[
            "module.basenet.slice1.0.weight",
            "module.conv_cls.8.bias",
        ])?)
        .strip_parallel_prefix()?;

        assert_eq!(plain.keys(), prefixed.keys());
        for key in plain.keys() {
            let a: Vec<f32> = plain.get(key).unwrap().to_vec1()?;
            let b: Vec<f32> = prefixed.get(key).unwrap().to_vec1()?;
            assert_eq!(a, b);
        }

        Ok(())
    }

    #[test]
    fn mixed_prefixes_are_rejected() -> anyhow::Result<()> {
        let dict = StateDict::new(tensors(&["module.conv.weight", "upconv1.conv.0.weight"])?);
        let err = dict.strip_parallel_prefix().unwrap_err();
        assert!(matches!(
            err,
            WeightsError::InconsistentPrefix { ref key, .. } if key == "upconv1.conv.0.weight"
        ));
        Ok(())
    }

    #[test]
    fn prefix_must_be_a_whole_segment() -> anyhow::Result<()> {
        let dict = StateDict::new(tensors(&["modules.conv.weight"])?).strip_parallel_prefix()?;
        assert_eq!(dict.keys(), vec!["modules.conv.weight"]);
        Ok(())
    }

    #[test]
    fn tensor_checks_shape_and_presence() -> anyhow::Result<()> {
        let mut dict = StateDict::new(tensors(&["a", "b"])?);

        assert_eq!(dict.tensor("a", &[2])?.dims(), &[2]);
        assert!(matches!(
            dict.tensor("a", &[2]),
            Err(WeightsError::MissingTensor(_))
        ));
        assert!(matches!(
            dict.tensor("b", &[3, 3]),
            Err(WeightsError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn finish_reports_leftovers() -> anyhow::Result<()> {
        let mut dict = StateDict::new(tensors(&["a", "bn.num_batches_tracked"])?);
        dict.tensor("a", &[2])?;
        dict.finish()?;

        let dict = StateDict::new(tensors(&["extra.weight"])?);
        match dict.finish() {
            Err(WeightsError::UnexpectedTensors(keys)) => assert_eq!(keys, vec!["extra.weight"]),
            other => panic!("expected unexpected tensors error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn load_reads_safetensors_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("craft.safetensors");
        candle_core::safetensors::save(&tensors(&["module.conv_cls.0.bias"])?, &path)?;

        let dict = StateDict::load(&path, &Device::Cpu)?.strip_parallel_prefix()?;
        assert_eq!(dict.keys(), vec!["conv_cls.0.bias"]);
        Ok(())
    }

    #[test]
    fn load_rejects_missing_and_unknown_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            StateDict::load(dir.path().join("missing.pth"), &Device::Cpu),
            Err(WeightsError::Io(_))
        ));

        let path = dir.path().join("weights.onnx");
        std::fs::write(&path, b"not a checkpoint")?;
        assert!(matches!(
            StateDict::load(&path, &Device::Cpu),
            Err(WeightsError::UnsupportedFormat(_))
        ));
        Ok(())
    }
}
