//! Face crop preprocessing.
//!
//! Turns a detector bounding box over an RGB frame into the fixed-shape
//! NHWC tensor the embedding model expects: square crop with symmetric
//! padding, clamped to the frame, bilinear resize, `(c - 128) / 128`.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: u32 = 160;
pub const DEFAULT_PAD_RATIO: f32 = 0.25;

const PIXEL_MEAN: f32 = 128.0;
const PIXEL_STD: f32 = 128.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreprocessError {
    #[error("invalid face region: {0}")]
    InvalidRegion(String),
}

/// A detected face: the full source frame plus the detector's bounding box.
#[derive(Debug, Clone)]
pub struct RawImageRegion {
    pub image: RgbImage,
    pub bbox: BoundingBox,
}

impl RawImageRegion {
    pub fn new(image: RgbImage, bbox: BoundingBox) -> Self {
        Self { image, bbox }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessOptions {
    /// Side length S of the square model input.
    pub size: u32,
    /// Symmetric padding ratio p applied to the larger box side.
    pub pad_ratio: f32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_INPUT_SIZE,
            pad_ratio: DEFAULT_PAD_RATIO,
        }
    }
}

/// Model input of shape `[1, S, S, 3]`, row-major, channels R,G,B, values in [-1, 1).
#[derive(Debug, Clone)]
pub struct InputTensor {
    data: Array4<f32>,
}

impl InputTensor {
    pub fn size(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn array(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn as_slice(&self) -> &[f32] {
        // Built by `Array4::zeros`, always standard layout.
        self.data.as_slice().unwrap_or(&[])
    }
}

/// Pixel rectangle inside the source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the padded square crop around `bbox`, clamped to a `width`×`height` frame.
pub fn square_crop(
    bbox: &BoundingBox,
    width: u32,
    height: u32,
    pad_ratio: f32,
) -> Result<CropRect, PreprocessError> {
    if width == 0 || height == 0 {
        return Err(PreprocessError::InvalidRegion("source image is empty".into()));
    }
    let coords = [bbox.x, bbox.y, bbox.width, bbox.height, pad_ratio];
    if coords.iter().any(|v| !v.is_finite()) {
        return Err(PreprocessError::InvalidRegion(format!(
            "non-finite box {bbox:?} / pad {pad_ratio}"
        )));
    }
    if bbox.width < 0.0 || bbox.height < 0.0 || pad_ratio < 0.0 {
        return Err(PreprocessError::InvalidRegion(format!(
            "negative box extent {bbox:?} / pad {pad_ratio}"
        )));
    }

    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;
    let half = bbox.width.max(bbox.height) * (1.0 + pad_ratio) / 2.0;

    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    // Box lies entirely outside the frame: nothing to clamp onto.
    if cx + half < 0.0 || cy + half < 0.0 || cx - half > max_x || cy - half > max_y {
        return Err(PreprocessError::InvalidRegion(format!(
            "box {bbox:?} outside {width}x{height} frame"
        )));
    }

    let left = (cx - half).floor().max(0.0) as u32;
    let top = (cy - half).floor().max(0.0) as u32;
    let right = (cx + half).floor().min(max_x) as u32;
    let bottom = (cy + half).floor().min(max_y) as u32;

    // Degenerate extents collapse to a single pixel, never past the frame edge.
    let crop_w = right.saturating_sub(left).max(1).min(width - left);
    let crop_h = bottom.saturating_sub(top).max(1).min(height - top);

    Ok(CropRect {
        left,
        top,
        width: crop_w,
        height: crop_h,
    })
}

/// Crop, resize and normalize a face region into an [`InputTensor`].
pub fn preprocess(
    region: &RawImageRegion,
    options: &PreprocessOptions,
) -> Result<InputTensor, PreprocessError> {
    if options.size == 0 {
        return Err(PreprocessError::InvalidRegion("target size is zero".into()));
    }

    let (width, height) = region.image.dimensions();
    let rect = square_crop(&region.bbox, width, height, options.pad_ratio)?;

    let cropped = imageops::crop_imm(&region.image, rect.left, rect.top, rect.width, rect.height)
        .to_image();
    let resized = imageops::resize(&cropped, options.size, options.size, FilterType::Triangle);

    tracing::trace!(?rect, size = options.size, "face crop prepared");

    Ok(normalize(&resized))
}

/// Normalize an S×S RGB image into a `[1, S, S, 3]` tensor.
fn normalize(face: &RgbImage) -> InputTensor {
    let (w, h) = face.dimensions();
    let mut data = Array4::<f32>::zeros((1, h as usize, w as usize, 3));

    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            data[[0, y as usize, x as usize, c]] = (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }

    InputTensor { data }
}
