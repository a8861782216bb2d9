//! Image geometry pipeline
//!
//! Pure functions that normalize images and masks around each model call:
//! budget downscaling and restoring, mask conforming, bounding boxes, canvas
//! extension with mirrored borders, and alpha compositing. Every function returns
//! a new buffer and never mutates its inputs.

use crate::error::{RetouchError, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

/// Mask values strictly above this are "region to modify"
pub const MASK_THRESHOLD: u8 = 127;

/// Context kept around a selection before re-segmenting it
pub const DEFAULT_BOX_PADDING: u32 = 50;

/// Largest canvas extension accepted per side
pub const MAX_EXTENSION: u32 = 500;

/// Axis-aligned rectangle with exclusive right/bottom edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl Rect {
    #[must_use]
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }

    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x_min && x < self.x_max && y >= self.y_min && y < self.y_max
    }
}

/// Pixels to add on each side of a canvas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanvasExtension {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl CanvasExtension {
    #[must_use]
    pub fn new(left: u32, right: u32, top: u32, bottom: u32) -> Self {
        Self {
            left,
            right,
            top,
            bottom,
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }

    /// Reject amounts outside `[0, MAX_EXTENSION]`
    ///
    /// # Errors
    /// - Any side larger than [`MAX_EXTENSION`]
    pub fn validate(&self) -> Result<()> {
        for (side, amount) in [
            ("extend_left", self.left),
            ("extend_right", self.right),
            ("extend_top", self.top),
            ("extend_bottom", self.bottom),
        ] {
            if amount > MAX_EXTENSION {
                return Err(RetouchError::config_value_error(
                    side,
                    amount,
                    &format!("0-{MAX_EXTENSION}"),
                ));
            }
        }
        Ok(())
    }

    /// Size of the extended canvas for a source of the given size
    #[must_use]
    pub fn extended_size(&self, (width, height): (u32, u32)) -> (u32, u32) {
        (
            width + self.left + self.right,
            height + self.top + self.bottom,
        )
    }
}

/// Target size when the larger side exceeds `max_dimension`, `None` if no resize is needed
///
/// The larger side lands exactly on `max_dimension`; the other side is scaled by the
/// same ratio and truncated, never below one pixel.
#[must_use]
pub fn budget_size((width, height): (u32, u32), max_dimension: Option<u32>) -> Option<(u32, u32)> {
    let max_dimension = max_dimension?;
    let larger = width.max(height);
    if larger <= max_dimension || max_dimension == 0 {
        return None;
    }

    let scale = |side: u32| -> u32 {
        let scaled = u64::from(side) * u64::from(max_dimension) / u64::from(larger);
        (scaled as u32).max(1)
    };
    Some((scale(width), scale(height)))
}

/// Downscale an image and its mask so the larger side fits `max_dimension`
///
/// The image is resampled with Lanczos3; the mask with nearest-neighbour so it stays
/// binary. Images already within budget are returned unchanged.
#[must_use]
pub fn downscale_for_budget(
    image: &RgbImage,
    mask: &GrayImage,
    max_dimension: Option<u32>,
) -> (RgbImage, GrayImage) {
    match budget_size(image.dimensions(), max_dimension) {
        Some((width, height)) => {
            tracing::debug!(
                from_width = image.width(),
                from_height = image.height(),
                to_width = width,
                to_height = height,
                "Downscaling for inference budget"
            );
            (
                imageops::resize(image, width, height, FilterType::Lanczos3),
                imageops::resize(mask, width, height, FilterType::Nearest),
            )
        },
        None => (image.clone(), mask.clone()),
    }
}

/// Downscale a lone image so the larger side fits `max_dimension`
#[must_use]
pub fn downscale_image_for_budget(image: &RgbImage, max_dimension: Option<u32>) -> RgbImage {
    match budget_size(image.dimensions(), max_dimension) {
        Some((width, height)) => imageops::resize(image, width, height, FilterType::Lanczos3),
        None => image.clone(),
    }
}

/// Resample a result back to the size recorded before downscaling
#[must_use]
pub fn restore_scale(result: &RgbImage, original_size: (u32, u32)) -> RgbImage {
    if result.dimensions() == original_size {
        return result.clone();
    }
    imageops::resize(
        result,
        original_size.0,
        original_size.1,
        FilterType::Lanczos3,
    )
}

/// Binarize a mask at [`MASK_THRESHOLD`]
#[must_use]
pub fn threshold_mask(mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let Luma([value]) = *mask.get_pixel(x, y);
        Luma([if value > MASK_THRESHOLD { 255 } else { 0 }])
    })
}

/// Fit a mask to `target_size` and force it to strictly 0/255
///
/// Resizing uses a bilinear filter to avoid staircase edges, then thresholding removes
/// the gray fringe the filter introduces. Idempotent.
#[must_use]
pub fn conform_mask(mask: &GrayImage, target_size: (u32, u32)) -> GrayImage {
    if mask.dimensions() == target_size {
        return threshold_mask(mask);
    }
    let resized = imageops::resize(mask, target_size.0, target_size.1, FilterType::Triangle);
    threshold_mask(&resized)
}

/// Fit a mask to `target_size` with nearest-neighbour sampling, keeping its values
#[must_use]
pub fn match_mask_size(mask: &GrayImage, target_size: (u32, u32)) -> GrayImage {
    if mask.dimensions() == target_size {
        return mask.clone();
    }
    imageops::resize(mask, target_size.0, target_size.1, FilterType::Nearest)
}

/// Tight box around all non-zero mask pixels, grown by `pad` and clamped to the mask
///
/// Returns `None` for an all-zero mask; callers must treat that as an empty selection.
#[must_use]
pub fn bounding_box_with_padding(mask: &GrayImage, pad: u32) -> Option<Rect> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;

    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    let (x_first, y_first, x_last, y_last) = bounds?;
    let (width, height) = mask.dimensions();

    Some(Rect {
        x_min: x_first.saturating_sub(pad),
        y_min: y_first.saturating_sub(pad),
        x_max: x_last.saturating_add(pad).saturating_add(1).min(width),
        y_max: y_last.saturating_add(pad).saturating_add(1).min(height),
    })
}

/// Copy the region described by `rect` out of an image
#[must_use]
pub fn crop(image: &RgbImage, rect: Rect) -> RgbImage {
    imageops::crop_imm(image, rect.x_min, rect.y_min, rect.width(), rect.height()).to_image()
}

/// Mirror index into `[0, len)`, repeating the edge pixel (`cba|abcd|dcb`)
fn reflect_index(index: i64, len: u32) -> u32 {
    let len = i64::from(len);
    let period = 2 * len;
    let folded = index.rem_euclid(period);
    let mirrored = if folded >= len {
        period - 1 - folded
    } else {
        folded
    };
    mirrored as u32
}

/// Extend the canvas on each side, filling the border by mirroring the source
///
/// Mirroring keeps texture continuous at the seam, which gives the inpainting model
/// far better context than a flat fill. A zero extension returns the image as is.
///
/// # Errors
/// - Any side larger than [`MAX_EXTENSION`]
/// - An empty source image
pub fn extend_canvas(image: &RgbImage, extension: CanvasExtension) -> Result<RgbImage> {
    extension.validate()?;
    if extension.is_zero() {
        return Ok(image.clone());
    }

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(RetouchError::processing("Cannot extend an empty image"));
    }

    let (new_width, new_height) = extension.extended_size((width, height));
    let left = i64::from(extension.left);
    let top = i64::from(extension.top);

    Ok(RgbImage::from_fn(new_width, new_height, |x, y| {
        let src_x = reflect_index(i64::from(x) - left, width);
        let src_y = reflect_index(i64::from(y) - top, height);
        *image.get_pixel(src_x, src_y)
    }))
}

/// Mask marking exactly the border added by [`extend_canvas`]: 255 outside, 0 inside
#[must_use]
pub fn border_mask(original_size: (u32, u32), extension: CanvasExtension) -> GrayImage {
    let (new_width, new_height) = extension.extended_size(original_size);
    let interior = Rect {
        x_min: extension.left,
        y_min: extension.top,
        x_max: extension.left + original_size.0,
        y_max: extension.top + original_size.1,
    };

    GrayImage::from_fn(new_width, new_height, |x, y| {
        Luma([if interior.contains(x, y) { 0 } else { 255 }])
    })
}

/// Porter-Duff "over": `foreground` composited onto `background`
///
/// # Errors
/// - The two buffers differ in size (resize the background first)
#[allow(clippy::many_single_char_names)]
pub fn alpha_composite(background: &RgbaImage, foreground: &RgbaImage) -> Result<RgbaImage> {
    if background.dimensions() != foreground.dimensions() {
        return Err(RetouchError::processing(format!(
            "Composite size mismatch: background {:?}, foreground {:?}",
            background.dimensions(),
            foreground.dimensions()
        )));
    }

    let mut output = RgbaImage::new(background.width(), background.height());
    for ((out, bg), fg) in output
        .pixels_mut()
        .zip(background.pixels())
        .zip(foreground.pixels())
    {
        let fg_alpha = f32::from(fg.0[3]) / 255.0;
        let bg_alpha = f32::from(bg.0[3]) / 255.0;
        let out_alpha = fg_alpha + bg_alpha * (1.0 - fg_alpha);

        if out_alpha <= f32::EPSILON {
            *out = Rgba([0, 0, 0, 0]);
            continue;
        }

        let blend = |f: u8, b: u8| -> u8 {
            let value =
                (f32::from(f) * fg_alpha + f32::from(b) * bg_alpha * (1.0 - fg_alpha)) / out_alpha;
            value.round().clamp(0.0, 255.0) as u8
        };

        *out = Rgba([
            blend(fg.0[0], bg.0[0]),
            blend(fg.0[1], bg.0[1]),
            blend(fg.0[2], bg.0[2]),
            (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8,
        ]);
    }

    Ok(output)
}

/// Resize an RGBA image to `size` with Lanczos3 if it differs
#[must_use]
pub fn resize_rgba(image: &RgbaImage, size: (u32, u32)) -> RgbaImage {
    if image.dimensions() == size {
        return image.clone();
    }
    imageops::resize(image, size.0, size.1, FilterType::Lanczos3)
}

/// `255 - v` for every pixel
#[must_use]
pub fn invert_mask(mask: &GrayImage) -> GrayImage {
    let mut inverted = mask.clone();
    imageops::invert(&mut inverted);
    inverted
}

/// Attach a mask as the alpha channel of an RGB image
///
/// # Errors
/// - Mask and image differ in size
pub fn apply_alpha(image: &RgbImage, mask: &GrayImage) -> Result<RgbaImage> {
    if image.dimensions() != mask.dimensions() {
        return Err(RetouchError::processing(format!(
            "Alpha mask size {:?} does not match image size {:?}",
            mask.dimensions(),
            image.dimensions()
        )));
    }

    Ok(RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        let Luma([alpha]) = *mask.get_pixel(x, y);
        Rgba([r, g, b, alpha])
    }))
}

/// Zero-filled mask of `canvas_size` with `crop_mask` pasted at `offset`
#[must_use]
pub fn paste_mask(canvas_size: (u32, u32), crop_mask: &GrayImage, offset: (u32, u32)) -> GrayImage {
    let mut canvas = GrayImage::new(canvas_size.0, canvas_size.1);
    imageops::replace(
        &mut canvas,
        crop_mask,
        i64::from(offset.0),
        i64::from(offset.1),
    );
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_budget_size_exact_larger_side() {
        assert_eq!(budget_size((2000, 1000), Some(1024)), Some((1024, 512)));
        assert_eq!(budget_size((1000, 3000), Some(512)), Some((170, 512)));
        assert_eq!(budget_size((1024, 800), Some(1024)), None);
        assert_eq!(budget_size((5000, 5000), None), None);
        assert_eq!(budget_size((4000, 1), Some(512)), Some((512, 1)));
    }

    #[test]
    fn test_downscale_keeps_mask_binary() {
        let image = gradient(800, 400);
        let mask = GrayImage::from_fn(800, 400, |x, _| Luma([if x < 401 { 255 } else { 0 }]));

        let (small_image, small_mask) = downscale_for_budget(&image, &mask, Some(512));
        assert_eq!(small_image.dimensions(), (512, 256));
        assert_eq!(small_mask.dimensions(), (512, 256));
        assert!(small_mask.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn test_conform_mask_removes_gray() {
        let mask = GrayImage::from_fn(10, 10, |x, y| Luma([if (x + y) % 2 == 0 { 255 } else { 0 }]));
        let conformed = conform_mask(&mask, (37, 23));
        assert_eq!(conformed.dimensions(), (37, 23));
        assert!(conformed.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert_eq!(conform_mask(&conformed, (37, 23)), conformed);
    }

    #[test]
    fn test_threshold_boundary() {
        let mask = GrayImage::from_raw(3, 1, vec![127, 128, 0]).unwrap();
        let binary = threshold_mask(&mask);
        assert_eq!(binary.as_raw(), &vec![0, 255, 0]);
    }

    #[test]
    fn test_bounding_box_clamps_at_edges() {
        let mut mask = GrayImage::new(100, 80);
        mask.put_pixel(10, 70, Luma([255]));
        mask.put_pixel(20, 75, Luma([1]));

        let rect = bounding_box_with_padding(&mask, DEFAULT_BOX_PADDING).unwrap();
        assert_eq!(
            rect,
            Rect {
                x_min: 0,
                y_min: 20,
                x_max: 71,
                y_max: 80
            }
        );
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-4, 4), 3);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(-5, 4), 3);
        assert_eq!(reflect_index(-9, 4), 0);
        assert_eq!(reflect_index(-3, 1), 0);
    }

    #[test]
    fn test_extend_canvas_reflects_all_sides() {
        let image = gradient(6, 4);
        let extended = extend_canvas(&image, CanvasExtension::new(2, 3, 1, 2)).unwrap();
        assert_eq!(extended.dimensions(), (11, 7));

        // Interior is untouched
        for y in 0..4 {
            for x in 0..6 {
                assert_eq!(extended.get_pixel(x + 2, y + 1), image.get_pixel(x, y));
            }
        }
        // Left border mirrors the first column first
        assert_eq!(extended.get_pixel(1, 1), image.get_pixel(0, 0));
        assert_eq!(extended.get_pixel(0, 1), image.get_pixel(1, 0));
        // Right border mirrors the last column first
        assert_eq!(extended.get_pixel(8, 1), image.get_pixel(5, 0));
        assert_eq!(extended.get_pixel(9, 1), image.get_pixel(4, 0));
        // Top border mirrors the first row
        assert_eq!(extended.get_pixel(2, 0), image.get_pixel(0, 0));
        // Bottom border
        assert_eq!(extended.get_pixel(2, 5), image.get_pixel(0, 3));
        assert_eq!(extended.get_pixel(2, 6), image.get_pixel(0, 2));
    }

    #[test]
    fn test_extend_canvas_rejects_large_amounts() {
        let image = gradient(4, 4);
        let err = extend_canvas(&image, CanvasExtension::new(0, 501, 0, 0)).unwrap_err();
        assert!(matches!(err, RetouchError::Validation(_)));
        assert!(err.to_string().contains("extend_right"));
    }

    #[test]
    fn test_extension_larger_than_source() {
        let image = gradient(3, 2);
        let extended = extend_canvas(&image, CanvasExtension::new(10, 0, 0, 0)).unwrap();
        assert_eq!(extended.dimensions(), (13, 2));
        // Reflection folds back and forth: source columns 0, 1, 2, 2, 1, 0, 0, ...
        assert_eq!(extended.get_pixel(9, 1), image.get_pixel(0, 1));
        assert_eq!(extended.get_pixel(7, 1), image.get_pixel(2, 1));
        assert_eq!(extended.get_pixel(6, 1), image.get_pixel(2, 1));
        assert_eq!(extended.get_pixel(4, 1), image.get_pixel(0, 1));
        assert_eq!(extended.get_pixel(3, 1), image.get_pixel(0, 1));
    }

    #[test]
    fn test_zero_extension_is_identity() {
        let image = gradient(5, 3);
        assert_eq!(extend_canvas(&image, CanvasExtension::default()).unwrap(), image);
    }

    #[test]
    fn test_border_mask_marks_only_new_area() {
        let mask = border_mask((4, 3), CanvasExtension::new(1, 2, 0, 1));
        assert_eq!(mask.dimensions(), (7, 4));
        let zeros = mask.pixels().filter(|p| p.0[0] == 0).count();
        assert_eq!(zeros, 12);
        assert_eq!(mask.get_pixel(0, 0).0[0], 255);
        assert_eq!(mask.get_pixel(1, 0).0[0], 0);
        assert_eq!(mask.get_pixel(4, 2).0[0], 0);
        assert_eq!(mask.get_pixel(5, 2).0[0], 255);
        assert_eq!(mask.get_pixel(1, 3).0[0], 255);
    }

    #[test]
    fn test_alpha_composite_over() {
        let background = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 255, 255]));
        let mut foreground = RgbaImage::new(2, 1);
        foreground.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        foreground.put_pixel(1, 0, Rgba([255, 0, 0, 128]));

        let out = alpha_composite(&background, &foreground).unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgba([255, 0, 0, 255]));

        let blended = out.get_pixel(1, 0);
        assert_eq!(blended.0[3], 255);
        assert_eq!(blended.0[0], 128);
        assert_eq!(blended.0[2], 127);
    }

    #[test]
    fn test_alpha_composite_transparent_pair() {
        let clear = RgbaImage::new(1, 1);
        let out = alpha_composite(&clear, &clear).unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_alpha_composite_size_mismatch() {
        let a = RgbaImage::new(2, 2);
        let b = RgbaImage::new(3, 2);
        assert!(alpha_composite(&a, &b).is_err());
    }

    #[test]
    fn test_invert_and_apply_alpha() {
        let mask = GrayImage::from_raw(2, 1, vec![0, 200]).unwrap();
        assert_eq!(invert_mask(&mask).as_raw(), &vec![255, 55]);

        let image = RgbImage::from_pixel(2, 1, Rgb([10, 20, 30]));
        let rgba = apply_alpha(&image, &mask).unwrap();
        assert_eq!(*rgba.get_pixel(1, 0), Rgba([10, 20, 30, 200]));
        assert!(apply_alpha(&image, &GrayImage::new(1, 1)).is_err());
    }

    #[test]
    fn test_paste_mask_at_offset() {
        let crop_mask = GrayImage::from_pixel(2, 2, Luma([255]));
        let canvas = paste_mask((5, 4), &crop_mask, (3, 3));
        assert_eq!(canvas.dimensions(), (5, 4));
        assert_eq!(canvas.get_pixel(3, 3).0[0], 255);
        assert_eq!(canvas.get_pixel(4, 3).0[0], 255);
        assert_eq!(canvas.get_pixel(2, 3).0[0], 0);
        assert_eq!(canvas.pixels().filter(|p| p.0[0] == 255).count(), 2);
    }

    #[test]
    fn test_crop_region() {
        let image = gradient(10, 10);
        let rect = Rect {
            x_min: 2,
            y_min: 3,
            x_max: 6,
            y_max: 8,
        };
        let cropped = crop(&image, rect);
        assert_eq!(cropped.dimensions(), (4, 5));
        assert_eq!(cropped.get_pixel(0, 0), image.get_pixel(2, 3));
    }
}
