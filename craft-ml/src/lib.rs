pub mod config;
pub mod detector;
pub mod error;
pub mod imgproc;
pub mod loading;
pub mod model;
pub mod postprocess;
pub mod region;

use anyhow::Result;
use candle_core::{Device, utils::metal_is_available};

pub use config::DetectorConfig;
pub use detector::{CraftDetector, Detection};
pub use error::WeightsError;
pub use region::TextRegion;

/// Name of the compute device being used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceName {
    Cpu,
    Cuda,
    Metal,
}

impl std::fmt::Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceName::Cpu => write!(f, "CPU"),
            DeviceName::Cuda => write!(f, "CUDA"),
            DeviceName::Metal => write!(f, "Metal"),
        }
    }
}

/// Returns the name of the device that would be selected.
pub fn device_name(cpu: bool) -> DeviceName {
    if cpu {
        DeviceName::Cpu
    } else if cuda_is_available() {
        DeviceName::Cuda
    } else if metal_is_available() {
        DeviceName::Metal
    } else {
        DeviceName::Cpu
    }
}

pub fn device(cpu: bool) -> Result<Device> {
    let device = match device_name(cpu) {
        DeviceName::Cuda => Device::new_cuda(0)?,
        DeviceName::Metal => Device::new_metal(0)?,
        DeviceName::Cpu => {
            if !cpu {
                tracing::info!("CUDA and Metal are not available, using CPU device");
            }
            Device::Cpu
        }
    };

    Ok(device)
}

pub fn cuda_is_available() -> bool {
    cfg!(feature = "cuda")
        && unsafe {
            libloading::Library::new(if cfg!(target_os = "windows") {
                "nvcuda.dll"
            } else {
                "libcuda.so"
            })
            .is_ok()
        }
}
