use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::postprocess::Thresholds;

/// Detection settings. Missing TOML fields fall back to the defaults the
/// pretrained checkpoints were tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    pub text_threshold: f32,
    pub link_threshold: f32,
    pub low_text: f32,
    /// Longest image side after magnification.
    pub canvas_size: u32,
    pub mag_ratio: f32,
    /// Pixels added around every detected region.
    pub padding: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            text_threshold: thresholds.text,
            link_threshold: thresholds.link,
            low_text: thresholds.low_text,
            canvas_size: 1280,
            mag_ratio: 1.5,
            padding: 5,
        }
    }
}

impl DetectorConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            text: self.text_threshold,
            link: self.link_threshold,
            low_text: self.low_text,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("text_threshold", self.text_threshold),
            ("link_threshold", self.link_threshold),
            ("low_text", self.low_text),
        ] {
            ensure!(
                (0.0..=1.0).contains(&value),
                "{name} must be within [0, 1], got {value}"
            );
        }
        ensure!(
            self.canvas_size >= 32,
            "canvas_size must be at least 32, got {}",
            self.canvas_size
        );
        ensure!(
            self.mag_ratio.is_finite() && self.mag_ratio > 0.0,
            "mag_ratio must be positive, got {}",
            self.mag_ratio
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pretrained_settings() {
        let config = DetectorConfig::default();
        assert_eq!(config.text_threshold, 0.7);
        assert_eq!(config.link_threshold, 0.4);
        assert_eq!(config.low_text, 0.4);
        assert_eq!(config.canvas_size, 1280);
        assert_eq!(config.mag_ratio, 1.5);
        assert_eq!(config.padding, 5);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("craft.toml");
        std::fs::write(&path, "text_threshold = 0.6\ncanvas_size = 2560\n")?;

        let config = DetectorConfig::from_toml_file(&path)?;
        assert_eq!(config.text_threshold, 0.6);
        assert_eq!(config.canvas_size, 2560);
        assert_eq!(config.link_threshold, 0.4);
        assert_eq!(config.padding, 5);
        Ok(())
    }

    #[test]
    fn rejects_invalid_values() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("craft.toml");

        std::fs::write(&path, "low_text = 1.5\n")?;
        assert!(DetectorConfig::from_toml_file(&path).is_err());

        std::fs::write(&path, "canvas = 1280\n")?;
        assert!(DetectorConfig::from_toml_file(&path).is_err());

        let config = DetectorConfig {
            mag_ratio: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        Ok(())
    }
}
