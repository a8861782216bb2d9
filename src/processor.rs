//! Request-level retouching operations
//!
//! Each operation takes decoded buffers, runs the geometry pipeline around the model
//! manager on the blocking pool and returns a buffer ready for encoding.

use crate::config::{Device, QualityPreset};
use crate::error::{RetouchError, Result};
use crate::manager::{lock_manager, SharedManager};
use crate::models::{ModelDescriptor, ModelId};
use crate::services::{cleaned_entry_name, ArchiveBuilder, ImageIOService};
use crate::utils::geometry::{
    alpha_composite, apply_alpha, bounding_box_with_padding, border_mask, crop,
    downscale_image_for_budget, extend_canvas, invert_mask, match_mask_size, paste_mask,
    resize_rgba, restore_scale, CanvasExtension, DEFAULT_BOX_PADDING,
};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{instrument, Span};

/// Edge refinement parameters
///
/// Kept for API compatibility with edge-detection clients; the refinement re-runs
/// segmentation and does not read them beyond validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefineParams {
    pub threshold1: u32,
    pub threshold2: u32,
    pub dilation: u32,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            threshold1: 50,
            threshold2: 150,
            dilation: 2,
        }
    }
}

impl RefineParams {
    /// # Errors
    /// - A threshold above 255 or a dilation above 64
    pub fn validate(&self) -> Result<()> {
        if self.threshold1 > 255 {
            return Err(RetouchError::config_value_error("threshold1", self.threshold1, "0-255"));
        }
        if self.threshold2 > 255 {
            return Err(RetouchError::config_value_error("threshold2", self.threshold2, "0-255"));
        }
        if self.dilation > 64 {
            return Err(RetouchError::config_value_error("dilation", self.dilation, "0-64"));
        }
        Ok(())
    }
}

/// One uploaded file in a batch
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub file_name: Option<String>,
    pub data: Vec<u8>,
}

/// Front door for every synchronous operation
#[derive(Debug, Clone)]
pub struct RetouchProcessor {
    manager: SharedManager,
}

impl RetouchProcessor {
    #[must_use]
    pub fn new(manager: SharedManager) -> Self {
        Self { manager }
    }

    /// Shared manager handle, for components that run their own workers
    #[must_use]
    pub fn manager(&self) -> SharedManager {
        Arc::clone(&self.manager)
    }

    /// Run `task` on the blocking pool inside the caller's span
    async fn run_blocking<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&SharedManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        let span = Span::current();
        tokio::task::spawn_blocking(move || span.in_scope(|| task(&manager))).await?
    }

    /// Active inference device
    ///
    /// # Errors
    /// - The blocking task could not be joined
    pub async fn device(&self) -> Result<Device> {
        self.run_blocking(|manager| Ok(lock_manager(manager).device()))
            .await
    }

    /// Backends usable on the current hardware
    ///
    /// # Errors
    /// - The blocking task could not be joined
    pub async fn available_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.run_blocking(|manager| Ok(lock_manager(manager).available_models()))
            .await
    }

    /// Foreground mask of `image`
    ///
    /// # Errors
    /// - Segmentation model unavailable or failing
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn detect_objects(&self, image: RgbImage) -> Result<GrayImage> {
        self.run_blocking(move |manager| lock_manager(manager).segment(&image))
            .await
    }

    /// Sharpen a rough selection by segmenting only the region around it
    ///
    /// An empty selection is returned as given.
    ///
    /// # Errors
    /// - Parameters out of range
    /// - Segmentation model unavailable or failing
    #[instrument(skip(self, image, mask), fields(width = image.width(), height = image.height()))]
    pub async fn refine_edges(
        &self,
        image: RgbImage,
        mask: GrayImage,
        params: RefineParams,
    ) -> Result<GrayImage> {
        params.validate()?;

        let working = match_mask_size(&mask, image.dimensions());
        let Some(rect) = bounding_box_with_padding(&working, DEFAULT_BOX_PADDING) else {
            tracing::debug!("Empty selection, returning mask unchanged");
            return Ok(mask);
        };

        tracing::debug!(
            x = rect.x_min,
            y = rect.y_min,
            width = rect.width(),
            height = rect.height(),
            "Refining selection"
        );
        let region = crop(&image, rect);
        let canvas_size = image.dimensions();

        self.run_blocking(move |manager| {
            let crop_mask = lock_manager(manager).segment(&region)?;
            Ok(paste_mask(canvas_size, &crop_mask, (rect.x_min, rect.y_min)))
        })
        .await
    }

    /// Cut the subject out, keeping it on a transparent background
    ///
    /// # Errors
    /// - Segmentation model unavailable or failing
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn remove_background(&self, image: RgbImage) -> Result<RgbaImage> {
        self.run_blocking(move |manager| {
            let mask = lock_manager(manager).segment(&image)?;
            apply_alpha(&image, &mask)
        })
        .await
    }

    /// Cut the subject out and place it over `background`
    ///
    /// The background is resized to the foreground's dimensions.
    ///
    /// # Errors
    /// - Segmentation model unavailable or failing
    #[instrument(skip(self, image, background), fields(width = image.width(), height = image.height()))]
    pub async fn replace_background(
        &self,
        image: RgbImage,
        background: RgbaImage,
    ) -> Result<RgbaImage> {
        self.run_blocking(move |manager| {
            let mask = lock_manager(manager).segment(&image)?;
            let foreground = apply_alpha(&image, &mask)?;
            let background = resize_rgba(&background, foreground.dimensions());
            alpha_composite(&background, &foreground)
        })
        .await
    }

    /// Segmentation mask, optionally inverted to select the background
    ///
    /// # Errors
    /// - Segmentation model unavailable or failing
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn auto_mask(&self, image: RgbImage, invert: bool) -> Result<GrayImage> {
        self.run_blocking(move |manager| {
            let mask = lock_manager(manager).segment(&image)?;
            Ok(if invert { invert_mask(&mask) } else { mask })
        })
        .await
    }

    /// Grow the canvas and let the primary model fill the new border
    ///
    /// # Errors
    /// - Any side above the extension limit
    /// - Inference failure
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height(), ?extension))]
    pub async fn outpaint(&self, image: RgbImage, extension: CanvasExtension) -> Result<RgbImage> {
        extension.validate()?;
        if extension.is_zero() {
            return Ok(image);
        }

        self.run_blocking(move |manager| {
            let extended = extend_canvas(&image, extension)?;
            let mask = border_mask(image.dimensions(), extension);
            let (result, _) = lock_manager(manager).process(&extended, &mask, ModelId::PRIMARY)?;
            Ok(result)
        })
        .await
    }

    /// Remove the background of every file and return a ZIP of the results
    ///
    /// Files that fail are logged and left out of the archive.
    ///
    /// # Errors
    /// - The archive itself cannot be written
    #[instrument(skip(self, items), fields(files = items.len(), %quality))]
    pub async fn batch_inpaint(&self, items: Vec<BatchItem>, quality: QualityPreset) -> Result<Vec<u8>> {
        self.run_blocking(move |manager| {
            let start = Instant::now();
            let mut archive = ArchiveBuilder::new();

            for (index, item) in items.iter().enumerate() {
                let name = cleaned_entry_name(item.file_name.as_deref(), index);
                let added = clean_item(manager, &item.data, quality)
                    .and_then(|png| archive.add(&name, &png));
                match added {
                    Ok(entry) => tracing::debug!(entry = %entry, "Batch item written"),
                    Err(e) => {
                        let file = item.file_name.as_deref().unwrap_or("<unnamed>");
                        if e.is_client_error() {
                            tracing::warn!(file, error = %e, "Skipping unreadable batch item");
                        } else {
                            tracing::error!(file, error = %e, "Skipping failed batch item");
                        }
                    },
                }
            }

            tracing::info!(
                written = archive.len(),
                skipped = items.len() - archive.len(),
                elapsed_ms = start.elapsed().as_millis(),
                "Batch finished"
            );
            archive.finish()
        })
        .await
    }
}

/// Decode, mask the background and inpaint it, returning PNG bytes
fn clean_item(manager: &SharedManager, data: &[u8], quality: QualityPreset) -> Result<Vec<u8>> {
    let image = ImageIOService::load_from_bytes(data)?.to_rgb8();
    let original_size = image.dimensions();
    let working = downscale_image_for_budget(&image, quality.max_dimension());

    let result = {
        let mut manager = lock_manager(manager);
        let background = invert_mask(&manager.segment(&working)?);
        manager.process(&working, &background, ModelId::PRIMARY)?.0
    };

    let restored = restore_scale(&result, original_size);
    ImageIOService::encode_png(&DynamicImage::ImageRgb8(restored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{MockBackendFactory, MockBehavior, StaticDeviceProbe, LAMA_FILL};
    use crate::config::ModelConfig;
    use crate::manager::ModelManager;
    use image::{Luma, Rgb, Rgba};
    use std::io::Cursor;
    use std::sync::Mutex;

    fn processor(behavior: MockBehavior) -> RetouchProcessor {
        let manager = ModelManager::new(
            ModelConfig::default(),
            Box::new(MockBackendFactory::new(behavior)),
            &StaticDeviceProbe::cpu_only(),
        )
        .unwrap();
        RetouchProcessor::new(Arc::new(Mutex::new(manager)))
    }

    /// Left half bright, right half dark; the mock segmenter keeps the bright half
    fn split_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([240, 240, 240])
            } else {
                Rgb([20, 20, 20])
            }
        })
    }

    #[tokio::test]
    async fn test_detect_and_auto_mask() {
        let processor = processor(MockBehavior::default());
        let mask = processor.detect_objects(split_image(10, 4)).await.unwrap();
        assert_eq!(mask.get_pixel(0, 0).0[0], 255);
        assert_eq!(mask.get_pixel(9, 0).0[0], 0);

        let inverted = processor.auto_mask(split_image(10, 4), true).await.unwrap();
        assert_eq!(inverted.get_pixel(0, 0).0[0], 0);
        assert_eq!(inverted.get_pixel(9, 0).0[0], 255);
    }

    #[tokio::test]
    async fn test_remove_background_sets_alpha() {
        let processor = processor(MockBehavior::default());
        let cutout = processor.remove_background(split_image(10, 4)).await.unwrap();
        assert_eq!(*cutout.get_pixel(0, 0), Rgba([240, 240, 240, 255]));
        assert_eq!(cutout.get_pixel(9, 0).0[3], 0);
    }

    #[tokio::test]
    async fn test_replace_background_resizes_and_composites() {
        let processor = processor(MockBehavior::default());
        let background = RgbaImage::from_pixel(3, 3, Rgba([0, 0, 255, 255]));
        let composite = processor
            .replace_background(split_image(10, 4), background)
            .await
            .unwrap();
        assert_eq!(composite.dimensions(), (10, 4));
        assert_eq!(*composite.get_pixel(0, 0), Rgba([240, 240, 240, 255]));
        assert_eq!(*composite.get_pixel(9, 3), Rgba([0, 0, 255, 255]));
    }

    #[tokio::test]
    async fn test_refine_empty_mask_is_returned_unchanged() {
        let processor = processor(MockBehavior::default());
        let mask = GrayImage::new(5, 5);
        let refined = processor
            .refine_edges(split_image(10, 10), mask.clone(), RefineParams::default())
            .await
            .unwrap();
        assert_eq!(refined, mask);
    }

    #[tokio::test]
    async fn test_refine_pastes_crop_mask_at_offset() {
        let processor = processor(MockBehavior::default());
        let image = split_image(200, 200);
        let mut mask = GrayImage::new(200, 200);
        mask.put_pixel(150, 150, Luma([255]));

        let refined = processor
            .refine_edges(image, mask, RefineParams::default())
            .await
            .unwrap();
        assert_eq!(refined.dimensions(), (200, 200));
        // Crop spans x 100..200, all of it in the dark half
        assert!(refined.pixels().all(|p| p.0[0] == 0));
    }

    #[tokio::test]
    async fn test_refine_rejects_out_of_range_params() {
        let processor = processor(MockBehavior::default());
        let params = RefineParams {
            threshold1: 300,
            ..RefineParams::default()
        };
        let result = processor
            .refine_edges(split_image(4, 4), GrayImage::new(4, 4), params)
            .await;
        assert!(matches!(result, Err(RetouchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_outpaint_fills_border_only() {
        let processor = processor(MockBehavior::default());
        let image = RgbImage::from_pixel(4, 4, Rgb([9, 9, 9]));
        let result = processor
            .outpaint(image, CanvasExtension::new(2, 0, 0, 1))
            .await
            .unwrap();
        assert_eq!(result.dimensions(), (6, 5));
        assert_eq!(*result.get_pixel(0, 0), LAMA_FILL);
        assert_eq!(*result.get_pixel(2, 0), Rgb([9, 9, 9]));
        assert_eq!(*result.get_pixel(3, 4), LAMA_FILL);
    }

    #[tokio::test]
    async fn test_outpaint_zero_extension_is_identity() {
        let processor = processor(MockBehavior::default());
        let image = split_image(6, 3);
        let result = processor
            .outpaint(image.clone(), CanvasExtension::default())
            .await
            .unwrap();
        assert_eq!(result, image);
    }

    #[tokio::test]
    async fn test_outpaint_rejects_large_extension() {
        let processor = processor(MockBehavior::default());
        let result = processor
            .outpaint(split_image(4, 4), CanvasExtension::new(501, 0, 0, 0))
            .await;
        assert!(matches!(result, Err(RetouchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_batch_skips_corrupt_items() {
        let processor = processor(MockBehavior::default());
        let png = ImageIOService::encode_png(&DynamicImage::ImageRgb8(split_image(8, 8))).unwrap();
        let items = vec![
            BatchItem { file_name: Some("one.jpg".into()), data: png.clone() },
            BatchItem { file_name: Some("two.png".into()), data: b"not an image".to_vec() },
            BatchItem { file_name: None, data: png },
        ];

        let bytes = processor.batch_inpaint(items, QualityPreset::Fast).await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<_> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"one_cleaned.png".to_string()));
        assert!(names.contains(&"image_3_cleaned.png".to_string()));

        let mut entry = archive.by_name("one_cleaned.png").unwrap();
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
        let cleaned = ImageIOService::load_from_bytes(&data).unwrap().to_rgb8();
        assert_eq!(cleaned.dimensions(), (8, 8));
        // Dark half is background, so it was inpainted
        assert_eq!(*cleaned.get_pixel(7, 0), LAMA_FILL);
        assert_eq!(*cleaned.get_pixel(0, 0), Rgb([240, 240, 240]));
    }

    #[tokio::test]
    async fn test_batch_keeps_items_with_same_name() {
        let processor = processor(MockBehavior::default());
        let png = ImageIOService::encode_png(&DynamicImage::ImageRgb8(split_image(8, 8))).unwrap();
        let items = vec![
            BatchItem { file_name: Some("image.png".into()), data: png.clone() },
            BatchItem { file_name: Some("image.png".into()), data: png.clone() },
            BatchItem { file_name: Some("image.jpg".into()), data: png.clone() },
            BatchItem { file_name: Some("other.png".into()), data: png },
        ];

        let bytes = processor.batch_inpaint(items, QualityPreset::Fast).await.unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "image_cleaned.png",
                "image_cleaned_2.png",
                "image_cleaned_3.png",
                "other_cleaned.png",
            ]
        );
    }

    #[tokio::test]
    async fn test_device_and_models() {
        let processor = processor(MockBehavior::default());
        assert_eq!(processor.device().await.unwrap(), Device::Cpu);
        let models = processor.available_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, ModelId::Lama);
    }
}
