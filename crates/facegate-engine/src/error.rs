use facegate_core::{ComparisonError, CropError, DetectorError};
use facegate_hw::{CameraError, CaptureError};
use thiserror::Error;

/// Session-ending failures. After one of these the engine takes no further
/// automatic action; the caller closes it and starts a new one.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face detection model failed to load: {0}")]
    ModelLoad(#[from] DetectorError),
    #[error("camera stream lost: {0}")]
    Capture(#[from] CaptureError),
    #[error("engine task exited")]
    ChannelClosed,
}

impl EngineError {
    /// Static message shown while the session sits in its failed state.
    pub fn user_message(&self) -> String {
        match self {
            // Camera errors are surfaced verbatim.
            EngineError::Camera(err) => err.to_string(),
            EngineError::ModelLoad(_) => {
                "Face detection is unavailable. Close and reopen to retry.".to_string()
            }
            EngineError::Capture(_) => {
                "The camera stopped responding. Close and reopen to retry.".to_string()
            }
            EngineError::ChannelClosed => "The camera session has ended.".to_string(),
        }
    }
}

/// Failures that abort one capture attempt and return to `RetryReady`.
#[derive(Error, Debug)]
pub enum RetryCause {
    #[error("crop failed: {0}")]
    Crop(#[from] CropError),
    #[error("comparison failed: {0}")]
    Comparison(#[from] ComparisonError),
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
}

impl RetryCause {
    pub fn user_message(&self) -> &'static str {
        match self {
            RetryCause::Crop(_) => "The photo could not be processed. Please try again.",
            RetryCause::Comparison(_) => "Verification could not be completed. Please try again.",
            RetryCause::Capture(_) => "The photo could not be taken. Please try again.",
        }
    }
}
