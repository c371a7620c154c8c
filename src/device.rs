//! # Device and Precision Selection
//!
//! Maps the `device` and `compute_type` settings onto a Candle device and
//! weight dtype, with CPU fallback when the requested accelerator is not
//! available.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device};
use tracing::{debug, info, warn};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// CUDA GPU (falls back to CPU if not available)
    Cuda,
    /// Metal GPU (falls back to CPU if not available)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            _ => Err(anyhow!(
                "Unknown device '{}'. Expected one of: auto, cpu, cuda, metal",
                s
            )),
        }
    }
}

/// Resolve a preference to a concrete device.
pub fn resolve_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda_device().unwrap_or_else(|| {
            warn!("CUDA requested but not available, falling back to CPU");
            Device::Cpu
        }),
        DevicePreference::Metal => metal_device().unwrap_or_else(|| {
            warn!("Metal requested but not available, falling back to CPU");
            Device::Cpu
        }),
        DevicePreference::Auto => {
            if let Some(device) = cuda_device() {
                info!("Selected CUDA GPU for inference");
                device
            } else if let Some(device) = metal_device() {
                info!("Selected Metal GPU for inference");
                device
            } else {
                info!("Using CPU for inference (no GPU acceleration available)");
                Device::Cpu
            }
        }
    }
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}

/// Weight dtype for a `compute_type` setting on a given device.
///
/// Candle has no int8 Whisper kernels, so the integer variants run in
/// float32. Half precision is only used on accelerators.
pub fn dtype_for(compute_type: &str, device: &Device) -> Result<DType> {
    let half_ok = !device.is_cpu();
    match compute_type.to_lowercase().as_str() {
        "default" | "auto" | "int8" | "int8_float32" | "int16" | "float32" => Ok(DType::F32),
        "float16" | "int8_float16" if half_ok => Ok(DType::F16),
        "bfloat16" | "int8_bfloat16" if half_ok => Ok(DType::BF16),
        "float16" | "int8_float16" | "bfloat16" | "int8_bfloat16" => {
            debug!("{} is not supported on CPU, using float32", compute_type);
            Ok(DType::F32)
        }
        other => Err(anyhow!("Unknown compute type '{}'", other)),
    }
}

/// Human-readable device name for logs.
pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA GPU",
        Device::Metal(_) => "Metal GPU",
    }
}
