//! Deterministic in-process backends
//!
//! These stand in for ONNX Runtime in tests and local development. Inpainting
//! paints masked pixels with a per-model colour, segmentation thresholds
//! brightness. Failures are injected through [`MockBehavior`] and every call is
//! recorded so tests can assert on load and retry sequences.

use crate::config::{Device, ModelConfig};
use crate::error::{RetouchError, Result};
use crate::inference::{BackendFactory, InpaintBackend, SegmentationBackend};
use crate::models::ModelId;
use crate::utils::geometry::MASK_THRESHOLD;
use crate::utils::{AcceleratorInfo, DeviceProbe};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::sync::{Arc, Mutex};

/// Colour the mock LaMa backend writes into masked pixels
pub const LAMA_FILL: Rgb<u8> = Rgb([0, 200, 0]);
/// Colour the mock diffusion backend writes into masked pixels
pub const SDXL_FILL: Rgb<u8> = Rgb([0, 0, 200]);

/// Failure injection switches
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Inpainter loads fail on CUDA
    pub fail_load_on_cuda: bool,
    /// Inpainter loads fail on CPU
    pub fail_load_on_cpu: bool,
    /// Inpainting fails on CUDA (simulates out-of-memory)
    pub fail_inference_on_cuda: bool,
    /// Inpainting fails on CPU
    pub fail_inference_on_cpu: bool,
    /// The diffusion backend cannot be loaded
    pub fail_sdxl_load: bool,
    /// Number of segmenter loads that fail before one succeeds
    pub failing_segmenter_loads: usize,
    /// Inpainting panics instead of returning
    pub panic_on_inference: bool,
}

/// Shared call log
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn record(&self, entry: String) {
        if let Ok(mut log) = self.0.lock() {
            log.push(entry);
        }
    }

    /// Snapshot of the recorded calls
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of recorded calls starting with `prefix`
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Mock inpainting backend
#[derive(Debug)]
pub struct MockInpaintBackend {
    model: ModelId,
    device: Device,
    behavior: MockBehavior,
    calls: CallLog,
}

impl InpaintBackend for MockInpaintBackend {
    fn model_id(&self) -> ModelId {
        self.model
    }

    fn device(&self) -> Device {
        self.device
    }

    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
        self.calls
            .record(format!("inpaint {} {}", self.model, self.device));

        if self.behavior.panic_on_inference {
            panic!("mock inference panic");
        }

        let fails = match self.device {
            Device::Cuda => self.behavior.fail_inference_on_cuda,
            Device::Cpu => self.behavior.fail_inference_on_cpu,
        };
        if fails {
            return Err(RetouchError::inference_error_with_device(
                &self.device.to_string(),
                "Mock inpainting",
                "simulated failure",
            ));
        }

        if image.dimensions() != mask.dimensions() {
            return Err(RetouchError::processing("Mask does not match image"));
        }

        let fill = match self.model {
            ModelId::Lama => LAMA_FILL,
            ModelId::Sdxl => SDXL_FILL,
        };
        let mut result = image.clone();
        for (x, y, pixel) in result.enumerate_pixels_mut() {
            if mask.get_pixel(x, y).0[0] > MASK_THRESHOLD {
                *pixel = fill;
            }
        }
        Ok(result)
    }
}

/// Mock segmentation backend: pixels brighter than mid-grey are foreground
#[derive(Debug)]
pub struct MockSegmentationBackend {
    device: Device,
    calls: CallLog,
}

impl SegmentationBackend for MockSegmentationBackend {
    fn device(&self) -> Device {
        self.device
    }

    fn segment(&mut self, image: &RgbImage) -> Result<GrayImage> {
        self.calls.record(format!("segment {}", self.device));
        Ok(GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let [r, g, b] = image.get_pixel(x, y).0;
            let luma = (u32::from(r) + u32::from(g) + u32::from(b)) / 3;
            Luma([if luma > 127 { 255 } else { 0 }])
        }))
    }
}

/// Factory producing mock backends
#[derive(Debug, Default)]
pub struct MockBackendFactory {
    behavior: MockBehavior,
    calls: CallLog,
    segmenter_failures: Mutex<usize>,
}

impl MockBackendFactory {
    #[must_use]
    pub fn new(behavior: MockBehavior) -> Self {
        let failures = behavior.failing_segmenter_loads;
        Self {
            behavior,
            calls: CallLog::default(),
            segmenter_failures: Mutex::new(failures),
        }
    }

    /// Handle to the call log, valid after the factory is moved into a manager
    #[must_use]
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

impl BackendFactory for MockBackendFactory {
    fn create_inpainter(
        &self,
        model: ModelId,
        device: Device,
        _config: &ModelConfig,
    ) -> Result<Box<dyn InpaintBackend>> {
        self.calls.record(format!("load {} {}", model, device));

        if model == ModelId::Sdxl && self.behavior.fail_sdxl_load {
            return Err(RetouchError::model("Mock diffusion bundle unavailable"));
        }
        let fails = match device {
            Device::Cuda => self.behavior.fail_load_on_cuda,
            Device::Cpu => self.behavior.fail_load_on_cpu,
        };
        if fails {
            return Err(RetouchError::model(format!(
                "Mock {} load failed on {}",
                model, device
            )));
        }

        Ok(Box::new(MockInpaintBackend {
            model,
            device,
            behavior: self.behavior.clone(),
            calls: self.calls.clone(),
        }))
    }

    fn create_segmenter(
        &self,
        device: Device,
        _config: &ModelConfig,
    ) -> Result<Box<dyn SegmentationBackend>> {
        self.calls.record(format!("load segmentation {}", device));

        let mut remaining = self
            .segmenter_failures
            .lock()
            .map_err(|_| RetouchError::internal("Mock segmenter state poisoned"))?;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(RetouchError::model("Mock segmentation model unavailable"));
        }

        Ok(Box::new(MockSegmentationBackend {
            device,
            calls: self.calls.clone(),
        }))
    }
}

/// Device probe returning fixed hardware
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceProbe(pub Option<AcceleratorInfo>);

impl StaticDeviceProbe {
    /// A capable CUDA GPU
    #[must_use]
    pub fn cuda() -> Self {
        Self(Some(AcceleratorInfo {
            name: "Mock GPU".to_string(),
            compute_capability: Some((8, 6)),
        }))
    }

    /// No accelerator
    #[must_use]
    pub fn cpu_only() -> Self {
        Self(None)
    }
}

impl DeviceProbe for StaticDeviceProbe {
    fn probe_accelerator(&self) -> Option<AcceleratorInfo> {
        self.0.clone()
    }
}
