//! Face detection adapter: the stable seam in front of a detection model.

use crate::types::{BoundingBox, DetectionFrameResult};
use image::RgbImage;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-call detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    /// Faces scoring below this are dropped.
    pub min_confidence: f32,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self { min_confidence: 0.5 }
    }
}

/// Boxed detection future. `'static` so callers can hold it across other work.
pub type DetectFuture = Pin<Box<dyn Future<Output = Result<Vec<BoundingBox>, DetectorError>> + Send>>;

/// An asynchronous face detector.
///
/// Returns pixel-space boxes (with landmarks when the model provides them)
/// sorted by descending confidence.
pub trait FaceDetector: Send + Sync + 'static {
    fn detect(&self, image: Arc<RgbImage>, options: DetectOptions) -> DetectFuture;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Arc<D> {
    fn detect(&self, image: Arc<RgbImage>, options: DetectOptions) -> DetectFuture {
        (**self).detect(image, options)
    }
}

/// Run `detector` on a frame and express the result in frame-relative
/// coordinates. The confidence floor is enforced here as well, so backends
/// that ignore it still honour the contract.
pub fn detect_frame<D: FaceDetector + ?Sized>(
    detector: &D,
    image: Arc<RgbImage>,
    options: DetectOptions,
) -> impl Future<Output = Result<DetectionFrameResult, DetectorError>> + Send + 'static {
    let (width, height) = image.dimensions();
    let pending = detector.detect(image, options);
    async move {
        let boxes = pending.await?;
        let kept: Vec<BoundingBox> = boxes
            .into_iter()
            .filter(|b| b.confidence >= options.min_confidence)
            .collect();
        Ok(DetectionFrameResult::from_pixel_boxes(&kept, width, height))
    }
}
