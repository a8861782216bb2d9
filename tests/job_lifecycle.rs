//! Asynchronous inpainting jobs from submission to result

mod common;

use common::{config_with_bundle, cpu_manager, mock_manager, split_image};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imgly_retouch::backends::mock::{MockBehavior, StaticDeviceProbe, LAMA_FILL, SDXL_FILL};
use imgly_retouch::services::ImageIOService;
use imgly_retouch::{
    JobStatus, JobStatusView, JobTracker, ModelConfig, ModelId, QualityPreset, RetouchError,
};
use std::time::Duration;
use uuid::Uuid;

async fn wait_for_terminal(tracker: &JobTracker, job_id: Uuid) -> JobStatusView {
    for _ in 0..500 {
        let view = tracker.status(job_id).await.unwrap();
        if view.status != JobStatus::Processing {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

fn centre_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let inside = x >= width / 4 && x < 3 * width / 4 && y >= height / 4 && y < 3 * height / 4;
        Luma([if inside { 255 } else { 0 }])
    })
}

fn decode(bytes: &[u8]) -> RgbImage {
    ImageIOService::load_from_bytes(bytes).unwrap().to_rgb8()
}

#[tokio::test]
async fn completed_job_returns_png_at_original_size() {
    let tracker = JobTracker::new(cpu_manager());
    let image = split_image(1600, 900);

    let job_id = tracker
        .submit(image, centre_mask(1600, 900), QualityPreset::Fast, ModelId::Lama)
        .await;
    let view = wait_for_terminal(&tracker, job_id).await;

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.model, Some(ModelId::Lama));
    assert!(view.finished_at.is_some());

    let result = decode(&tracker.result(job_id).await.unwrap());
    assert_eq!(result.dimensions(), (1600, 900));
    assert_eq!(*result.get_pixel(800, 450), LAMA_FILL);
}

#[tokio::test]
async fn mask_of_other_size_is_conformed() {
    let tracker = JobTracker::new(cpu_manager());
    let job_id = tracker
        .submit(split_image(64, 48), centre_mask(16, 12), QualityPreset::High, ModelId::Lama)
        .await;

    assert_eq!(wait_for_terminal(&tracker, job_id).await.status, JobStatus::Completed);
    let result = decode(&tracker.result(job_id).await.unwrap());
    assert_eq!(result.dimensions(), (64, 48));
    assert_eq!(*result.get_pixel(32, 24), LAMA_FILL);
}

#[tokio::test]
async fn small_mask_is_conformed_before_budget_downscale() {
    let tracker = JobTracker::new(cpu_manager());
    let image = RgbImage::from_pixel(1000, 1000, Rgb([50, 50, 50]));
    let mut mask = GrayImage::new(10, 10);
    mask.put_pixel(5, 5, Luma([255]));

    let job_id = tracker
        .submit(image, mask, QualityPreset::Fast, ModelId::Lama)
        .await;
    assert_eq!(wait_for_terminal(&tracker, job_id).await.status, JobStatus::Completed);
    let result = decode(&tracker.result(job_id).await.unwrap());

    assert_eq!(result.dimensions(), (1000, 1000));
    assert_eq!(*result.get_pixel(550, 550), LAMA_FILL);
    // Bilinear upsampling then thresholding rounds the block's corners off
    assert_eq!(*result.get_pixel(505, 505), Rgb([50, 50, 50]));
    assert_eq!(*result.get_pixel(594, 594), Rgb([50, 50, 50]));
}

#[tokio::test]
async fn diffusion_request_uses_diffusion_on_cuda() {
    let (manager, _) = mock_manager(
        MockBehavior::default(),
        &StaticDeviceProbe::cuda(),
        config_with_bundle(),
    );
    let tracker = JobTracker::new(manager);

    let job_id = tracker
        .submit(split_image(32, 32), centre_mask(32, 32), QualityPreset::High, ModelId::Sdxl)
        .await;
    let view = wait_for_terminal(&tracker, job_id).await;

    assert_eq!(view.requested_model, ModelId::Sdxl);
    assert_eq!(view.model, Some(ModelId::Sdxl));
    let result = decode(&tracker.result(job_id).await.unwrap());
    assert_eq!(*result.get_pixel(16, 16), SDXL_FILL);
}

#[tokio::test]
async fn diffusion_request_on_cpu_falls_back_to_lama() {
    let tracker = JobTracker::new(cpu_manager());
    let job_id = tracker
        .submit(split_image(32, 32), centre_mask(32, 32), QualityPreset::High, ModelId::Sdxl)
        .await;
    let view = wait_for_terminal(&tracker, job_id).await;

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.model, Some(ModelId::Lama));
}

#[tokio::test]
async fn failed_job_reports_error_and_has_no_result() {
    let behavior = MockBehavior {
        fail_inference_on_cpu: true,
        ..MockBehavior::default()
    };
    let (manager, _) = mock_manager(behavior, &StaticDeviceProbe::cpu_only(), ModelConfig::default());
    let tracker = JobTracker::new(manager);

    let job_id = tracker
        .submit(split_image(16, 16), centre_mask(16, 16), QualityPreset::Fast, ModelId::Lama)
        .await;
    let view = wait_for_terminal(&tracker, job_id).await;

    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error.is_some());
    assert!(matches!(
        tracker.result(job_id).await,
        Err(RetouchError::InvalidState(_))
    ));
}

#[tokio::test]
async fn many_jobs_complete_independently() {
    let tracker = JobTracker::new(cpu_manager());
    let mut ids = Vec::new();
    for side in [8, 16, 24, 32] {
        ids.push(
            tracker
                .submit(
                    split_image(side, side),
                    centre_mask(side, side),
                    QualityPreset::Balanced,
                    ModelId::Lama,
                )
                .await,
        );
    }

    assert_eq!(tracker.len().await, 4);
    for (job_id, side) in ids.into_iter().zip([8, 16, 24, 32]) {
        assert_eq!(wait_for_terminal(&tracker, job_id).await.status, JobStatus::Completed);
        let result = decode(&tracker.result(job_id).await.unwrap());
        assert_eq!(result.dimensions(), (side, side));
    }
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let tracker = JobTracker::new(cpu_manager());
    let missing = Uuid::new_v4();
    assert!(matches!(tracker.status(missing).await, Err(RetouchError::NotFound(_))));
    assert!(matches!(tracker.result(missing).await, Err(RetouchError::NotFound(_))));
}

#[test]
fn status_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&JobStatus::Processing).unwrap(), "\"processing\"");
    assert_eq!(serde_json::to_string(&JobStatus::Completed).unwrap(), "\"completed\"");
    assert_eq!(serde_json::to_string(&JobStatus::Failed).unwrap(), "\"failed\"");
}
