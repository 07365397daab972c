//! Per-frame validation: turns one detection result into a guidance status.

use crate::types::{DetectionFrameResult, ModeKind};
use serde::{Deserialize, Serialize};

/// Discrete outcome of validating a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Idle,
    Detecting,
    NoFace,
    MultipleFaces,
    OffCenter,
    Valid,
    Error,
}

/// A [`ValidationKind`] plus the guidance text shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStatus {
    pub kind: ValidationKind,
    pub message: Option<String>,
}

impl ValidationStatus {
    fn new(kind: ValidationKind, message: &str) -> Self {
        Self {
            kind,
            message: Some(message.to_string()),
        }
    }

    pub fn idle() -> Self {
        Self {
            kind: ValidationKind::Idle,
            message: None,
        }
    }

    pub fn detecting() -> Self {
        Self::new(ValidationKind::Detecting, "Initializing face detection...")
    }

    /// Status for a tick whose detection call failed.
    pub fn detection_failed() -> Self {
        Self::new(ValidationKind::Error, "Face detection error. Retrying...")
    }

    pub fn is_valid(&self) -> bool {
        self.kind == ValidationKind::Valid
    }
}

/// Maximum allowed offset of the face center from the frame center, as a
/// fraction of frame width (`x`) and height (`y`). Offsets equal to the
/// tolerance are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CenterTolerance {
    pub x: f32,
    pub y: f32,
}

impl Default for CenterTolerance {
    fn default() -> Self {
        Self { x: 0.15, y: 0.20 }
    }
}

/// Classify one detection result.
///
/// The decision is identical in both modes; only the guidance text differs.
pub fn classify(
    result: &DetectionFrameResult,
    frame_width: u32,
    frame_height: u32,
    mode: ModeKind,
    tolerance: &CenterTolerance,
) -> ValidationStatus {
    if frame_width == 0 || frame_height == 0 {
        return ValidationStatus::new(ValidationKind::Error, "Camera frame is empty.");
    }

    let face = match result.faces.as_slice() {
        [] => {
            return ValidationStatus::new(
                ValidationKind::NoFace,
                "No face detected. Please look at the camera.",
            )
        }
        [face] => face,
        _ => {
            return ValidationStatus::new(
                ValidationKind::MultipleFaces,
                "Multiple faces detected. Only one person should be in frame.",
            )
        }
    };

    let (cx, cy) = face.bbox.center();
    if !cx.is_finite() || !cy.is_finite() {
        return ValidationStatus::new(ValidationKind::Error, "Face position could not be determined.");
    }

    let off_x = (cx - 0.5).abs();
    let off_y = (cy - 0.5).abs();
    if off_x > tolerance.x || off_y > tolerance.y {
        return ValidationStatus::new(
            ValidationKind::OffCenter,
            "Please center your face in the frame.",
        );
    }

    match mode {
        ModeKind::Register => ValidationStatus::new(ValidationKind::Valid, "Face detected. Ready to capture."),
        ModeKind::Verify => ValidationStatus::new(ValidationKind::Valid, "Face detected. Hold still..."),
    }
}
