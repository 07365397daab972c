//! Centered crop to a canonical aspect ratio.
//!
//! Every image that is compared or handed out for storage goes through
//! [`crop`], so stored and compared geometry always agree.

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

/// Relative tolerance under which source and target ratios count as equal.
const RATIO_EPSILON: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CropError {
    #[error("invalid target aspect ratio {0}")]
    InvalidAspect(f32),
    #[error("crop of {source_width}x{source_height} produced a {width}x{height} region")]
    Degenerate {
        source_width: u32,
        source_height: u32,
        width: i64,
        height: i64,
    },
}

/// Region of the source image kept by the crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the centered crop of a `width`×`height` source for
/// `target_aspect` (width / height).
///
/// A wider source keeps its full height and is trimmed left and right; a
/// taller source keeps its full width and is trimmed top and bottom.
/// Dimensions are rounded to whole pixels.
pub fn crop_box(width: u32, height: u32, target_aspect: f32) -> Result<CropBox, CropError> {
    if !target_aspect.is_finite() || target_aspect <= 0.0 {
        return Err(CropError::InvalidAspect(target_aspect));
    }
    let degenerate = |w: i64, h: i64| CropError::Degenerate {
        source_width: width,
        source_height: height,
        width: w,
        height: h,
    };
    if width == 0 || height == 0 {
        return Err(degenerate(width as i64, height as i64));
    }

    let target = target_aspect as f64;
    let (w, h) = (width as f64, height as f64);
    let source = w / h;

    let (sx, sy, sw, sh) = if (source - target).abs() <= RATIO_EPSILON * target {
        (0, 0, width as i64, height as i64)
    } else if source > target {
        let sw = (h * target).round() as i64;
        let sx = ((w - sw as f64) / 2.0).round() as i64;
        (sx, 0, sw, height as i64)
    } else {
        let sh = (w / target).round() as i64;
        let sy = ((h - sh as f64) / 2.0).round() as i64;
        (0, sy, width as i64, sh)
    };

    if sw <= 0 || sh <= 0 {
        return Err(degenerate(sw, sh));
    }

    Ok(CropBox {
        x: sx as u32,
        y: sy as u32,
        width: sw as u32,
        height: sh as u32,
    })
}

/// Crop `image` to `target_aspect`. Never falls back to the uncropped
/// image: a degenerate crop is an error.
pub fn crop(image: &RgbImage, target_aspect: f32) -> Result<RgbImage, CropError> {
    let (width, height) = image.dimensions();
    let region = crop_box(width, height, target_aspect)?;
    if region.width == width && region.height == height {
        return Ok(image.clone());
    }

    tracing::debug!(
        source_width = width,
        source_height = height,
        x = region.x,
        y = region.y,
        width = region.width,
        height = region.height,
        "cropping to canonical aspect"
    );
    Ok(image::imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image())
}
