//! facegate-hw: camera session lifecycle and frame capture.
//!
//! Provides the camera resource manager (acquire/release with a
//! constraint fallback), the frame type handed to detection, and a
//! V4L2 backend.

pub mod camera;
pub mod frame;
pub mod v4l2;

pub use camera::{
    CameraBackend, CameraError, CameraResourceManager, CaptureError, Facing, SessionState,
    StreamConstraints, VideoStream,
};
pub use frame::Frame;
pub use v4l2::{DeviceInfo, V4l2Backend};
