//! Accelerator detection and device selection
//!
//! The accelerator is only used when ONNX Runtime can run CUDA kernels and the GPU
//! reports a compute capability at or above the configured minimum. Probing sits
//! behind [`DeviceProbe`] so device selection can be exercised without hardware.

use crate::config::{Device, ModelConfig};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider as OrtExecutionProvider};
use std::process::Command;

/// Information about a detected accelerator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    /// Device name as reported by the driver
    pub name: String,
    /// Compute capability (major, minor), if it could be read
    pub compute_capability: Option<(u32, u32)>,
}

/// Source of hardware information
pub trait DeviceProbe: Send + Sync {
    /// Return the accelerator if one is usable by the inference runtime
    fn probe_accelerator(&self) -> Option<AcceleratorInfo>;
}

/// Probe backed by ONNX Runtime provider availability and `nvidia-smi`
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtDeviceProbe;

impl OrtDeviceProbe {
    /// Query name and compute capability of the first GPU
    fn query_nvidia_smi() -> Option<(String, Option<(u32, u32)>)> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=name,compute_cap", "--format=csv,noheader"])
            .output()
            .ok()?;

        if !output.status.success() {
            log::debug!("nvidia-smi exited with {}", output.status);
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next()?;
        let (name, capability) = first.rsplit_once(',')?;
        Some((name.trim().to_string(), parse_compute_capability(capability)))
    }
}

impl DeviceProbe for OrtDeviceProbe {
    fn probe_accelerator(&self) -> Option<AcceleratorInfo> {
        log::debug!("🔍 Checking CUDA availability...");
        let cuda_available =
            OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        if !cuda_available {
            log::debug!("❌ CUDA execution provider is not available");
            return None;
        }

        log::info!("✅ CUDA execution provider is available");
        let (name, compute_capability) = Self::query_nvidia_smi()
            .unwrap_or_else(|| ("unknown CUDA device".to_string(), None));

        Some(AcceleratorInfo {
            name,
            compute_capability,
        })
    }
}

/// Parse a `major.minor` capability string such as `8.6`
#[must_use]
pub fn parse_compute_capability(value: &str) -> Option<(u32, u32)> {
    let (major, minor) = value.trim().split_once('.')?;
    Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
}

/// Pick the device for this process
///
/// `force_cpu` wins over any hardware. An accelerator whose capability is below the
/// minimum, or cannot be read, is skipped in favour of the CPU.
pub fn select_device(probe: &dyn DeviceProbe, config: &ModelConfig) -> Device {
    if config.force_cpu {
        tracing::info!("FORCE_CPU set, using CPU");
        return Device::Cpu;
    }

    let Some(accelerator) = probe.probe_accelerator() else {
        tracing::info!("No accelerator detected, using CPU");
        return Device::Cpu;
    };

    match accelerator.compute_capability {
        Some(capability) if capability >= config.min_compute_capability => {
            tracing::info!(
                device_name = %accelerator.name,
                capability = %format!("{}.{}", capability.0, capability.1),
                "Using CUDA device"
            );
            Device::Cuda
        },
        Some(capability) => {
            tracing::warn!(
                device_name = %accelerator.name,
                capability = %format!("{}.{}", capability.0, capability.1),
                required = %format!(
                    "{}.{}",
                    config.min_compute_capability.0, config.min_compute_capability.1
                ),
                "GPU compute capability too old, falling back to CPU"
            );
            Device::Cpu
        },
        None => {
            tracing::warn!(
                device_name = %accelerator.name,
                "Could not determine GPU compute capability, falling back to CPU"
            );
            Device::Cpu
        },
    }
}
