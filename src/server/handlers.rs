//! Request handlers
//!
//! Handlers decode uploads, call the processor or job tracker and encode the reply.
//! Decoding and encoding run on the blocking pool since they are CPU bound.

use super::error::{AppError, AppResult};
use super::AppState;
use crate::config::QualityPreset;
use crate::error::RetouchError;
use crate::jobs::{JobStatus, JobStatusView};
use crate::models::{ModelDescriptor, ModelId};
use crate::processor::{BatchItem, RefineParams};
use crate::services::ImageIOService;
use crate::utils::CanvasExtension;
use axum::extract::multipart::Multipart;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One file part of a multipart form
#[derive(Debug)]
pub(crate) struct Upload {
    file_name: Option<String>,
    data: Vec<u8>,
}

/// All file parts of a multipart form, in upload order
#[derive(Debug, Default)]
pub(crate) struct UploadForm {
    parts: Vec<(String, Upload)>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> AppResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {e}")))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let file_name = field.file_name().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read field '{name}': {e}")))?;
            form.parts.push((
                name,
                Upload {
                    file_name,
                    data: data.to_vec(),
                },
            ));
        }
        Ok(form)
    }

    /// Remove and return the first part called `name`
    fn take(&mut self, name: &str) -> AppResult<Upload> {
        let index = self
            .parts
            .iter()
            .position(|(part, _)| part == name)
            .ok_or_else(|| AppError::BadRequest(format!("Missing multipart field '{name}'")))?;
        Ok(self.parts.remove(index).1)
    }

    /// Remove and return every part called `name`
    fn take_all(&mut self, name: &str) -> Vec<Upload> {
        let (matching, rest) = std::mem::take(&mut self.parts)
            .into_iter()
            .partition(|(part, _)| part == name);
        self.parts = rest;
        matching.into_iter().map(|(_, upload)| upload).collect()
    }
}

async fn decode(upload: Upload) -> AppResult<DynamicImage> {
    let image =
        tokio::task::spawn_blocking(move || ImageIOService::load_from_bytes(&upload.data))
            .await
            .map_err(RetouchError::from)??;
    Ok(image)
}

async fn decode_rgb(upload: Upload) -> AppResult<RgbImage> {
    Ok(decode(upload).await?.to_rgb8())
}

async fn decode_mask(upload: Upload) -> AppResult<GrayImage> {
    Ok(decode(upload).await?.to_luma8())
}

async fn png_response(image: DynamicImage) -> AppResult<Response> {
    let bytes = tokio::task::spawn_blocking(move || ImageIOService::encode_png(&image))
        .await
        .map_err(RetouchError::from)??;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> AppResult<T> {
    query
        .map(|Query(value)| value)
        .map_err(|e| AppError::BadRequest(e.body_text()))
}

/// Ids that do not parse can never name a job
fn parse_job_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| RetouchError::job_not_found(raw).into())
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    device: String,
}

pub(crate) async fn health(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let device = state.processor.device().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        device: device.to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub(crate) struct DeviceResponse {
    device: String,
    device_name: &'static str,
}

pub(crate) async fn device(State(state): State<AppState>) -> AppResult<Json<DeviceResponse>> {
    let device = state.processor.device().await?;
    Ok(Json(DeviceResponse {
        device: device.to_string(),
        device_name: device.display_name(),
    }))
}

pub(crate) async fn models(State(state): State<AppState>) -> AppResult<Json<Vec<ModelDescriptor>>> {
    Ok(Json(state.processor.available_models().await?))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InpaintQuery {
    quality: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitResponse {
    job_id: Uuid,
    status: JobStatus,
}

pub(crate) async fn submit_inpaint(
    State(state): State<AppState>,
    params: Result<Query<InpaintQuery>, QueryRejection>,
    multipart: Multipart,
) -> AppResult<Json<SubmitResponse>> {
    let params = query(params)?;
    let quality = params
        .quality
        .as_deref()
        .map_or(QualityPreset::default(), QualityPreset::parse_or_default);
    let model = match params.model.as_deref() {
        Some(name) => name.parse::<ModelId>()?,
        None => ModelId::PRIMARY,
    };

    let mut form = UploadForm::read(multipart).await?;
    let image = decode_rgb(form.take("image")?).await?;
    let mask = decode_mask(form.take("mask")?).await?;

    let job_id = state.jobs.submit(image, mask, quality, model).await;
    tracing::info!(%job_id, %quality, %model, "Inpaint job submitted");

    Ok(Json(SubmitResponse {
        job_id,
        status: JobStatus::Processing,
    }))
}

pub(crate) async fn job_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Json<JobStatusView>> {
    let job_id = parse_job_id(&raw_id)?;
    Ok(Json(state.jobs.status(job_id).await?))
}

pub(crate) async fn job_result(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Response> {
    let job_id = parse_job_id(&raw_id)?;
    let bytes = state.jobs.result(job_id).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], Vec::clone(&bytes)).into_response())
}

pub(crate) async fn detect_objects(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Response> {
    let mut form = UploadForm::read(multipart).await?;
    let image = decode_rgb(form.take("image")?).await?;
    let mask = state.processor.detect_objects(image).await?;
    png_response(DynamicImage::ImageLuma8(mask)).await
}

pub(crate) async fn refine_edges(
    State(state): State<AppState>,
    params: Result<Query<RefineParams>, QueryRejection>,
    multipart: Multipart,
) -> AppResult<Response> {
    let params = query(params)?;
    let mut form = UploadForm::read(multipart).await?;
    let image = decode_rgb(form.take("image")?).await?;
    let mask = decode_mask(form.take("mask")?).await?;
    let refined = state.processor.refine_edges(image, mask, params).await?;
    png_response(DynamicImage::ImageLuma8(refined)).await
}

pub(crate) async fn remove_background(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Response> {
    let mut form = UploadForm::read(multipart).await?;
    let image = decode_rgb(form.take("image")?).await?;
    let cutout = state.processor.remove_background(image).await?;
    png_response(DynamicImage::ImageRgba8(cutout)).await
}

pub(crate) async fn replace_background(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Response> {
    let mut form = UploadForm::read(multipart).await?;
    let image = decode_rgb(form.take("image")?).await?;
    let background: RgbaImage = decode(form.take("background")?).await?.to_rgba8();
    let composite = state.processor.replace_background(image, background).await?;
    png_response(DynamicImage::ImageRgba8(composite)).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AutoMaskQuery {
    invert: bool,
}

pub(crate) async fn auto_mask(
    State(state): State<AppState>,
    params: Result<Query<AutoMaskQuery>, QueryRejection>,
    multipart: Multipart,
) -> AppResult<Response> {
    let params = query(params)?;
    let mut form = UploadForm::read(multipart).await?;
    let image = decode_rgb(form.take("image")?).await?;
    let mask = state.processor.auto_mask(image, params.invert).await?;
    png_response(DynamicImage::ImageLuma8(mask)).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct OutpaintQuery {
    extend_left: u32,
    extend_right: u32,
    extend_top: u32,
    extend_bottom: u32,
}

impl From<OutpaintQuery> for CanvasExtension {
    fn from(q: OutpaintQuery) -> Self {
        CanvasExtension::new(q.extend_left, q.extend_right, q.extend_top, q.extend_bottom)
    }
}

pub(crate) async fn outpaint(
    State(state): State<AppState>,
    params: Result<Query<OutpaintQuery>, QueryRejection>,
    multipart: Multipart,
) -> AppResult<Response> {
    let extension = CanvasExtension::from(query(params)?);
    extension.validate()?;

    let mut form = UploadForm::read(multipart).await?;
    let image = decode_rgb(form.take("image")?).await?;
    let result = state.processor.outpaint(image, extension).await?;
    png_response(DynamicImage::ImageRgb8(result)).await
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BatchQuery {
    quality: Option<String>,
}

/// Archive name announced to the client
pub const BATCH_ARCHIVE_NAME: &str = "cleaned_images.zip";

pub(crate) async fn batch_inpaint(
    State(state): State<AppState>,
    params: Result<Query<BatchQuery>, QueryRejection>,
    multipart: Multipart,
) -> AppResult<Response> {
    let params = query(params)?;
    let quality = params
        .quality
        .as_deref()
        .map_or(QualityPreset::default(), QualityPreset::parse_or_default);

    let mut form = UploadForm::read(multipart).await?;
    let items: Vec<BatchItem> = form
        .take_all("images")
        .into_iter()
        .map(|upload| BatchItem {
            file_name: upload.file_name,
            data: upload.data,
        })
        .collect();
    if items.is_empty() {
        return Err(AppError::BadRequest(
            "Missing multipart field 'images'".to_string(),
        ));
    }

    let archive = state.processor.batch_inpaint(items, quality).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={BATCH_ARCHIVE_NAME}"),
            ),
        ],
        archive,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(parts: &[(&str, &str)]) -> UploadForm {
        UploadForm {
            parts: parts
                .iter()
                .map(|(name, file)| {
                    (
                        (*name).to_string(),
                        Upload {
                            file_name: Some((*file).to_string()),
                            data: Vec::new(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_take_keeps_other_parts() {
        let mut form = form(&[("image", "a.png"), ("mask", "m.png")]);
        assert_eq!(form.take("mask").unwrap().file_name.as_deref(), Some("m.png"));
        assert!(matches!(form.take("mask"), Err(AppError::BadRequest(_))));
        assert_eq!(form.take("image").unwrap().file_name.as_deref(), Some("a.png"));
    }

    #[test]
    fn test_take_all_preserves_order() {
        let mut form = form(&[("images", "1.png"), ("other", "x"), ("images", "2.png")]);
        let names: Vec<_> = form
            .take_all("images")
            .into_iter()
            .filter_map(|u| u.file_name)
            .collect();
        assert_eq!(names, vec!["1.png", "2.png"]);
        assert_eq!(form.parts.len(), 1);
    }

    #[test]
    fn test_invalid_job_id_is_not_found() {
        assert!(matches!(
            parse_job_id("not-a-uuid"),
            Err(AppError::Retouch(RetouchError::NotFound(_)))
        ));
        assert!(parse_job_id("67e55044-10b1-426f-9247-bb680e5fe0c8").is_ok());
    }
}
