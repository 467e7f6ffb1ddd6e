mod common;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use craft_ml::{CraftDetector, DetectorConfig, TextRegion, device, device_name};
use serde::Serialize;

#[derive(Parser)]
#[command(about = "Detect text regions with CRAFT")]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    weights: PathBuf,

    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Where to write the input with detected boxes drawn on it.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Directory for the cropped regions, written as 0.jpg, 1.jpg, ...
    #[arg(long, value_name = "DIR")]
    crops: Option<PathBuf>,

    /// Where to write the region and link score maps.
    #[arg(long, value_name = "FILE")]
    heatmap: Option<PathBuf>,

    /// TOML file with detector settings.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    text_threshold: Option<f32>,

    #[arg(long)]
    link_threshold: Option<f32>,

    #[arg(long)]
    low_text: Option<f32>,

    #[arg(long)]
    canvas_size: Option<u32>,

    #[arg(long)]
    mag_ratio: Option<f32>,

    #[arg(long)]
    padding: Option<u32>,

    #[arg(long, default_value_t = false)]
    cpu: bool,

    /// Print the detected regions as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Cli {
    fn detector_config(&self) -> Result<DetectorConfig> {
        let mut config = match &self.config {
            Some(path) => DetectorConfig::from_toml_file(path)?,
            None => DetectorConfig::default(),
        };
        if let Some(value) = self.text_threshold {
            config.text_threshold = value;
        }
        if let Some(value) = self.link_threshold {
            config.link_threshold = value;
        }
        if let Some(value) = self.low_text {
            config.low_text = value;
        }
        if let Some(value) = self.canvas_size {
            config.canvas_size = value;
        }
        if let Some(value) = self.mag_ratio {
            config.mag_ratio = value;
        }
        if let Some(value) = self.padding {
            config.padding = value;
        }
        Ok(config)
    }
}

#[derive(Serialize)]
struct Report<'a> {
    regions: &'a [TextRegion],
    elapsed: f64,
}

fn main() -> Result<()> {
    common::init_tracing();

    let cli = Cli::parse();
    let config = cli.detector_config()?;
    tracing::info!(device = %device_name(cli.cpu), "selecting device");
    let device = device(cli.cpu)?;

    let detector = CraftDetector::load(&cli.weights, config, device)?;
    let image = image::open(&cli.input)
        .with_context(|| format!("failed to open {}", cli.input.display()))?
        .to_rgb8();

    let detection = detector.detect(&image)?;
    tracing::info!(
        regions = detection.regions.len(),
        elapsed = detection.elapsed_secs(),
        "detection finished"
    );

    if let Some(output) = &cli.output {
        detection
            .visualization
            .save(output)
            .with_context(|| format!("failed to write {}", output.display()))?;
    }

    if let Some(dir) = &cli.crops {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        for (i, region) in detection.regions.iter().enumerate() {
            if region.is_empty() {
                tracing::warn!(index = i, ?region, "skipping empty region");
                continue;
            }
            let path = dir.join(format!("{i}.jpg"));
            region
                .crop(&image)
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }

    if let Some(heatmap) = &cli.heatmap {
        detection
            .heatmap
            .save(heatmap)
            .with_context(|| format!("failed to write {}", heatmap.display()))?;
    }

    if cli.json {
        let report = Report {
            regions: &detection.regions,
            elapsed: detection.elapsed_secs(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}
