//! Asynchronous inpainting jobs
//!
//! A job starts in `Processing` and makes exactly one transition to `Completed` or
//! `Failed`. The state enum carries the result bytes and the error message, so a job
//! cannot hold a result without having completed or an error without having failed.

use crate::config::QualityPreset;
use crate::error::{RetouchError, Result};
use crate::manager::{lock_manager, SharedManager};
use crate::models::ModelId;
use crate::services::ImageIOService;
use crate::utils::geometry::{conform_mask, downscale_for_budget, restore_scale};
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::Instrument;
use uuid::Uuid;

/// Public job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
enum JobState {
    Processing,
    Completed { result: Arc<Vec<u8>>, model: ModelId },
    Failed { error: String },
}

#[derive(Debug, Clone)]
struct JobRecord {
    state: JobState,
    requested_model: ModelId,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by status polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Backend that produced the result, once completed
    pub model: Option<ModelId>,
    pub requested_model: ModelId,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatusView {
    fn from_record(job_id: Uuid, record: &JobRecord) -> Self {
        let (status, error, model) = match &record.state {
            JobState::Processing => (JobStatus::Processing, None, None),
            JobState::Completed { model, .. } => (JobStatus::Completed, None, Some(*model)),
            JobState::Failed { error } => (JobStatus::Failed, Some(error.clone()), None),
        };
        Self {
            job_id,
            status,
            error,
            model,
            requested_model: record.requested_model,
            created_at: record.created_at,
            finished_at: record.finished_at,
        }
    }
}

type JobTable = Arc<RwLock<HashMap<Uuid, JobRecord>>>;

/// In-process job table plus the worker that fills it
#[derive(Debug, Clone)]
pub struct JobTracker {
    jobs: JobTable,
    manager: SharedManager,
}

impl JobTracker {
    #[must_use]
    pub fn new(manager: SharedManager) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            manager,
        }
    }

    /// Register a job and start it in the background
    ///
    /// Returns as soon as the job is recorded; inference runs on the blocking pool.
    pub async fn submit(
        &self,
        image: RgbImage,
        mask: GrayImage,
        quality: QualityPreset,
        model: ModelId,
    ) -> Uuid {
        let job_id = Uuid::new_v4();
        self.jobs.write().await.insert(
            job_id,
            JobRecord {
                state: JobState::Processing,
                requested_model: model,
                created_at: Utc::now(),
                finished_at: None,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let manager = Arc::clone(&self.manager);
        let span = tracing::info_span!("inpaint_job", %job_id, %quality, requested = %model);

        tokio::spawn(
            async move {
                let outcome = run_inpaint(manager, image, mask, quality, model).await;
                let state = match outcome {
                    Ok((bytes, used)) => {
                        tracing::info!(model = %used, bytes = bytes.len(), "Job completed");
                        JobState::Completed {
                            result: Arc::new(bytes),
                            model: used,
                        }
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "Job failed");
                        JobState::Failed {
                            error: e.to_string(),
                        }
                    },
                };
                finish(&jobs, job_id, state).await;
            }
            .instrument(span),
        );

        job_id
    }

    /// Current status of a job
    ///
    /// # Errors
    /// - `NotFound` for unknown ids
    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| RetouchError::job_not_found(job_id))?;
        Ok(JobStatusView::from_record(job_id, record))
    }

    /// Encoded PNG of a completed job
    ///
    /// # Errors
    /// - `NotFound` for unknown ids
    /// - `InvalidState` while processing or after failure
    pub async fn result(&self, job_id: Uuid) -> Result<Arc<Vec<u8>>> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| RetouchError::job_not_found(job_id))?;
        match &record.state {
            JobState::Completed { result, .. } => Ok(Arc::clone(result)),
            JobState::Processing => Err(RetouchError::invalid_state(format!(
                "Job {job_id} is still processing"
            ))),
            JobState::Failed { error } => Err(RetouchError::invalid_state(format!(
                "Job {job_id} failed: {error}"
            ))),
        }
    }

    /// Number of jobs recorded since startup
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

/// Apply the single terminal transition; later attempts are ignored
async fn finish(jobs: &JobTable, job_id: Uuid, state: JobState) {
    let mut jobs = jobs.write().await;
    if let Some(record) = jobs.get_mut(&job_id) {
        if matches!(record.state, JobState::Processing) {
            record.state = state;
            record.finished_at = Some(Utc::now());
        } else {
            tracing::warn!(%job_id, "Ignoring second terminal transition");
        }
    }
}

/// Conform, downscale, inpaint, restore and encode on the blocking pool
async fn run_inpaint(
    manager: SharedManager,
    image: RgbImage,
    mask: GrayImage,
    quality: QualityPreset,
    model: ModelId,
) -> Result<(Vec<u8>, ModelId)> {
    tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, ModelId)> {
        let original_size = image.dimensions();
        // Conform at full size so the budget resize sees a mask matching the image
        let mask = conform_mask(&mask, original_size);
        let (work_image, work_mask) =
            downscale_for_budget(&image, &mask, quality.max_dimension());

        let (result, used) = lock_manager(&manager).process(&work_image, &work_mask, model)?;

        let restored = restore_scale(&result, original_size);
        let bytes = ImageIOService::encode_png(&DynamicImage::ImageRgb8(restored))?;
        Ok((bytes, used))
    })
    .await?
}
