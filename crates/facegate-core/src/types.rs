use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Pixel-space bounding box for a detected face, as produced by a detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl BoundingBox {
    /// Express this box (and its landmarks) as fractions of the frame size.
    pub fn normalized(&self, frame_width: u32, frame_height: u32) -> DetectedFace {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        DetectedFace {
            bbox: NormalizedBox {
                x: self.x / fw,
                y: self.y / fh,
                width: self.width / fw,
                height: self.height / fh,
            },
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx / fw, ly / fh))),
        }
    }
}

/// Box with coordinates as fractions of the frame dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl NormalizedBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One face in a [`DetectionFrameResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: NormalizedBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// Output of a single detection tick. Not retained past classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFrameResult {
    pub faces: Vec<DetectedFace>,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl DetectionFrameResult {
    pub fn from_pixel_boxes(boxes: &[BoundingBox], frame_width: u32, frame_height: u32) -> Self {
        Self {
            faces: boxes
                .iter()
                .map(|b| b.normalized(frame_width, frame_height))
                .collect(),
            frame_width,
            frame_height,
        }
    }
}

/// Encoded still (PNG/JPEG) of a previously stored face. Read-only.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    bytes: Arc<[u8]>,
}

impl ReferenceImage {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
        }
    }

    pub fn decode(&self) -> Result<image::RgbImage, image::ImageError> {
        Ok(image::load_from_memory(&self.bytes)?.to_rgb8())
    }
}

/// Workflow an engine instance runs. Fixed for the instance's lifetime.
#[derive(Debug, Clone)]
pub enum ScanMode {
    /// Enrollment: capture a canonical reference face.
    Register,
    /// Check-in: confirm the live face matches `ReferenceImage`.
    Verify(ReferenceImage),
}

impl ScanMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            ScanMode::Register => ModeKind::Register,
            ScanMode::Verify(_) => ModeKind::Verify,
        }
    }
}

/// [`ScanMode`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Register,
    Verify,
}
