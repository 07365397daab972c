//! facegate-core: face detection, frame validation and comparison.
//!
//! The detector itself is a pluggable capability behind [`FaceDetector`];
//! the shipped backend runs SCRFD via ONNX Runtime. Everything else here is
//! pure geometry over detector output.

pub mod classifier;
pub mod comparison;
pub mod detector;
pub mod geometry;
pub mod normalizer;
pub mod scrfd;
pub mod types;

pub use classifier::{classify, CenterTolerance, ValidationKind, ValidationStatus};
pub use comparison::{ComparisonError, Diagnostic, FaceComparator, MatchThresholds, VerificationResult};
pub use detector::{detect_frame, DetectFuture, DetectOptions, DetectorError, FaceDetector};
pub use normalizer::{crop, crop_box, CropBox, CropError};
pub use scrfd::ScrfdDetector;
pub use types::{
    BoundingBox, DetectedFace, DetectionFrameResult, Landmarks, ModeKind, NormalizedBox,
    ReferenceImage, ScanMode,
};
