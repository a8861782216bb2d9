//! Device demotion and backend fallback observed through the public operations

mod common;

use common::{config_with_bundle, mock_manager, split_image};
use image::{GrayImage, Luma};
use imgly_retouch::backends::mock::{MockBehavior, StaticDeviceProbe, LAMA_FILL};
use imgly_retouch::config::Device;
use imgly_retouch::{
    CanvasExtension, JobStatus, JobTracker, ModelConfig, ModelId, QualityPreset,
    RetouchError, RetouchProcessor,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn cuda_runtime_failure_moves_service_to_cpu() {
    let behavior = MockBehavior {
        fail_inference_on_cuda: true,
        ..MockBehavior::default()
    };
    let (manager, calls) = mock_manager(behavior, &StaticDeviceProbe::cuda(), ModelConfig::default());
    let processor = RetouchProcessor::new(Arc::clone(&manager));
    assert_eq!(processor.device().await.unwrap(), Device::Cuda);

    let result = processor
        .outpaint(split_image(20, 20), CanvasExtension::new(4, 0, 0, 0))
        .await
        .unwrap();
    assert_eq!(result.dimensions(), (24, 20));
    assert_eq!(*result.get_pixel(0, 10), LAMA_FILL);

    assert_eq!(processor.device().await.unwrap(), Device::Cpu);
    assert_eq!(calls.count("inpaint lama cuda"), 1);
    assert_eq!(calls.count("inpaint lama cpu"), 1);

    // Later requests go straight to the CPU backend
    processor
        .outpaint(split_image(20, 20), CanvasExtension::new(0, 0, 2, 0))
        .await
        .unwrap();
    assert_eq!(calls.count("inpaint lama cuda"), 1);
    assert_eq!(calls.count("inpaint lama cpu"), 2);
}

#[tokio::test]
async fn failure_on_both_devices_reaches_the_caller() {
    let behavior = MockBehavior {
        fail_inference_on_cuda: true,
        fail_inference_on_cpu: true,
        ..MockBehavior::default()
    };
    let (manager, _) = mock_manager(behavior, &StaticDeviceProbe::cuda(), ModelConfig::default());
    let processor = RetouchProcessor::new(manager);

    let outcome = processor
        .outpaint(split_image(10, 10), CanvasExtension::new(1, 1, 1, 1))
        .await;
    assert!(matches!(outcome, Err(RetouchError::Inference(_))));
}

#[tokio::test]
async fn broken_diffusion_bundle_disappears_from_model_list() {
    let behavior = MockBehavior {
        fail_sdxl_load: true,
        ..MockBehavior::default()
    };
    let (manager, calls) = mock_manager(behavior, &StaticDeviceProbe::cuda(), config_with_bundle());
    let processor = RetouchProcessor::new(Arc::clone(&manager));
    let jobs = JobTracker::new(manager);

    let listed: Vec<ModelId> = processor
        .available_models()
        .await
        .unwrap()
        .into_iter()
        .map(|model| model.id)
        .collect();
    assert_eq!(listed, vec![ModelId::Lama, ModelId::Sdxl]);

    for _ in 0..2 {
        let mask = GrayImage::from_pixel(12, 12, Luma([255]));
        let job_id = jobs
            .submit(split_image(12, 12), mask, QualityPreset::High, ModelId::Sdxl)
            .await;
        let mut view = jobs.status(job_id).await.unwrap();
        while view.status == JobStatus::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
            view = jobs.status(job_id).await.unwrap();
        }
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.model, Some(ModelId::Lama));
    }

    assert_eq!(calls.count("load sdxl"), 1);
    let listed: Vec<ModelId> = processor
        .available_models()
        .await
        .unwrap()
        .into_iter()
        .map(|model| model.id)
        .collect();
    assert_eq!(listed, vec![ModelId::Lama]);
}

#[tokio::test]
async fn cpu_device_never_offers_diffusion() {
    let (manager, _) = mock_manager(
        MockBehavior::default(),
        &StaticDeviceProbe::cpu_only(),
        config_with_bundle(),
    );
    let processor = RetouchProcessor::new(manager);
    let models = processor.available_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, ModelId::PRIMARY);
}

#[tokio::test]
async fn forced_cpu_ignores_accelerator() {
    let config = ModelConfig::builder().force_cpu(true).build().unwrap();
    let (manager, calls) = mock_manager(MockBehavior::default(), &StaticDeviceProbe::cuda(), config);
    let processor = RetouchProcessor::new(manager);

    assert_eq!(processor.device().await.unwrap(), Device::Cpu);
    assert_eq!(calls.count("load lama cuda"), 0);
}

#[tokio::test]
async fn segmentation_load_is_retried_on_next_request() {
    let behavior = MockBehavior {
        failing_segmenter_loads: 1,
        ..MockBehavior::default()
    };
    let (manager, calls) = mock_manager(behavior, &StaticDeviceProbe::cpu_only(), ModelConfig::default());
    let processor = RetouchProcessor::new(manager);

    let first = processor.auto_mask(split_image(10, 10), false).await;
    assert!(matches!(first, Err(RetouchError::Model(_))));

    let mask = processor.auto_mask(split_image(10, 10), false).await.unwrap();
    assert_eq!(mask.get_pixel(1, 5).0[0], 255);
    assert_eq!(mask.get_pixel(8, 5).0[0], 0);
    assert_eq!(calls.count("load segmentation"), 2);
}

#[tokio::test]
async fn missing_diffusion_bundle_is_not_fatal() {
    let config = ModelConfig::builder()
        .diffusion_bundle("/nonexistent/sdxl")
        .build()
        .unwrap();
    let (manager, calls) = mock_manager(MockBehavior::default(), &StaticDeviceProbe::cuda(), config);
    let jobs = JobTracker::new(Arc::clone(&manager));

    let mask = GrayImage::from_pixel(12, 12, Luma([255]));
    let job_id = jobs
        .submit(split_image(12, 12), mask, QualityPreset::High, ModelId::Sdxl)
        .await;
    let mut view = jobs.status(job_id).await.unwrap();
    while view.status == JobStatus::Processing {
        tokio::time::sleep(Duration::from_millis(5)).await;
        view = jobs.status(job_id).await.unwrap();
    }

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.requested_model, ModelId::Sdxl);
    assert_eq!(view.model, Some(ModelId::Lama));
    assert_eq!(calls.count("load sdxl"), 0);
}
