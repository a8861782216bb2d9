//! Shared helpers for integration tests

#![allow(dead_code)]

use image::{DynamicImage, Rgb, RgbImage};
use imgly_retouch::backends::mock::{CallLog, MockBackendFactory, MockBehavior, StaticDeviceProbe};
use imgly_retouch::services::ImageIOService;
use imgly_retouch::{ModelConfig, ModelManager, SharedManager};
use std::sync::{Arc, Mutex};

/// Manager over mock backends, plus the log of backend calls
pub fn mock_manager(
    behavior: MockBehavior,
    probe: &StaticDeviceProbe,
    config: ModelConfig,
) -> (SharedManager, CallLog) {
    let factory = MockBackendFactory::new(behavior);
    let calls = factory.calls();
    let manager = ModelManager::new(config, Box::new(factory), probe).unwrap();
    (Arc::new(Mutex::new(manager)), calls)
}

/// CPU-only manager with default behavior
pub fn cpu_manager() -> SharedManager {
    mock_manager(
        MockBehavior::default(),
        &StaticDeviceProbe::cpu_only(),
        ModelConfig::default(),
    )
    .0
}

/// Config naming an existing directory as diffusion bundle
pub fn config_with_bundle() -> ModelConfig {
    ModelConfig::builder()
        .diffusion_bundle(std::env::temp_dir())
        .build()
        .unwrap()
}

/// Bright left half (foreground for the mock segmenter), dark right half
pub fn split_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Rgb([230, 230, 230])
        } else {
            Rgb([30, 30, 30])
        }
    })
}

pub fn png(image: DynamicImage) -> Vec<u8> {
    ImageIOService::encode_png(&image).unwrap()
}

/// Minimal multipart/form-data encoder
pub struct MultipartBody {
    body: Vec<u8>,
}

impl MultipartBody {
    pub const BOUNDARY: &'static str = "retouch-test-boundary";

    pub fn new() -> Self {
        Self { body: Vec::new() }
    }

    pub fn file(mut self, name: &str, file_name: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                Self::BOUNDARY, name, file_name
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn content_type() -> String {
        format!("multipart/form-data; boundary={}", Self::BOUNDARY)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", Self::BOUNDARY).as_bytes());
        self.body
    }
}
