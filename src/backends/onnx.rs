//! ONNX Runtime session construction and tensor extraction
//!
//! Every ONNX-backed model goes through [`build_session`], which binds the session to
//! exactly one device. A CUDA session refuses to silently fall back to CPU kernels so
//! the model manager can observe the failure and demote explicitly.

use crate::config::Device;
use crate::error::{RetouchError, Result};
use ndarray::{Array4, Ix4};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider as OrtExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{DynValue, Tensor};
use std::path::Path;
use std::time::Instant;

/// Resolve the intra-op thread count (`0` = all available cores)
#[must_use]
pub fn resolve_intra_threads(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(8)
    }
}

/// Build a session for `model_path` on `device`
///
/// # Errors
/// - Model file missing
/// - CUDA requested but the provider cannot be registered
/// - ONNX Runtime rejects the graph
pub fn build_session(
    model_path: &Path,
    device: Device,
    intra_threads: usize,
    label: &str,
) -> Result<Session> {
    let load_start = Instant::now();

    if !model_path.is_file() {
        return Err(RetouchError::model(format!(
            "{} model not found at '{}'",
            label,
            model_path.display()
        )));
    }

    let mut session_builder = Session::builder()
        .map_err(|e| RetouchError::model(format!("Failed to create session builder: {e}")))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| RetouchError::model(format!("Failed to set optimization level: {e}")))?;

    session_builder = match device {
        Device::Cuda => {
            let cuda_provider = CUDAExecutionProvider::default();
            if !OrtExecutionProvider::is_available(&cuda_provider).unwrap_or(false) {
                return Err(RetouchError::model(format!(
                    "CUDA execution provider unavailable for {}",
                    label
                )));
            }
            log::info!("🚀 Loading {} on CUDA", label);
            session_builder
                .with_execution_providers([cuda_provider.build().error_on_failure()])
                .map_err(|e| {
                    RetouchError::model(format!("Failed to set CUDA execution provider: {e}"))
                })?
        },
        Device::Cpu => {
            log::info!("Loading {} on CPU", label);
            session_builder
        },
    };

    let intra_threads = resolve_intra_threads(intra_threads);
    let session = session_builder
        .with_intra_threads(intra_threads)
        .map_err(|e| RetouchError::model(format!("Failed to set intra threads: {e}")))?
        .commit_from_file(model_path)
        .map_err(|e| {
            RetouchError::model(format!(
                "Failed to create {} session from '{}': {e}",
                label,
                model_path.display()
            ))
        })?;

    log::debug!("✅ ONNX Runtime session created");
    log::debug!("  - Model: {}", model_path.display());
    log::debug!("  - Device: {}", device);
    log::debug!("  - Threading: {intra_threads} intra-op threads");
    log::info!(
        "📊 {} loaded in {:.0}ms",
        label,
        load_start.elapsed().as_secs_f64() * 1000.0
    );

    Ok(session)
}

/// Copy an output value into an owned 4D tensor
///
/// # Errors
/// - Output is not an f32 tensor
/// - Output is not 4-dimensional
pub fn value_to_array4(value: &DynValue) -> Result<Array4<f32>> {
    let view = value
        .try_extract_array::<f32>()
        .map_err(|e| RetouchError::processing(format!("Failed to extract output tensor: {e}")))?;

    let ndim = view.ndim();
    view.to_owned().into_dimensionality::<Ix4>().map_err(|_| {
        RetouchError::processing(format!("Expected 4D output tensor, got {ndim}D"))
    })
}

/// Wrap an owned array as an ONNX Runtime input tensor
///
/// # Errors
/// - Array is not in a layout ONNX Runtime accepts
pub fn to_tensor(array: Array4<f32>) -> Result<Tensor<f32>> {
    Tensor::from_array(array.as_standard_layout().into_owned())
        .map_err(|e| RetouchError::processing(format!("Failed to convert input tensor: {e}")))
}

/// Map a runtime failure to an inference error carrying the device
pub fn inference_failure(device: Device, label: &str, error: &ort::Error) -> RetouchError {
    RetouchError::inference_error_with_device(&device.to_string(), label, &error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_intra_threads() {
        assert_eq!(resolve_intra_threads(3), 3);
        assert!(resolve_intra_threads(0) >= 1);
    }

    #[test]
    fn test_missing_model_is_model_error() {
        let result = build_session(Path::new("/no/such/model.onnx"), Device::Cpu, 1, "LaMa");
        assert!(matches!(result, Err(RetouchError::Model(_))));
    }
}
