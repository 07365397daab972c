//! Camera resource management: one scoped stream per session.
//!
//! The manager owns at most one live stream. Acquisition tries the
//! preferred constraints, then a minimal request; release is idempotent
//! and also runs on drop.

use crate::frame::Frame;
use thiserror::Error;

/// Acquisition failures. Terminal for the session that hit them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera not found: {0}")]
    DeviceNotFound(String),
    #[error("camera is in use by another application")]
    DeviceBusy,
    #[error("camera error: {0}")]
    Unknown(String),
}

/// Failures reading from an acquired stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera is not streaming")]
    NotStreaming,
    #[error("camera stream ended")]
    StreamEnded,
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// Which way the requested camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

/// Requested stream properties. `None` leaves the choice to the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConstraints {
    pub facing: Option<Facing>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl StreamConstraints {
    /// Front-facing camera at the given target resolution.
    pub fn preferred(width: u32, height: u32) -> Self {
        Self {
            facing: Some(Facing::User),
            width: Some(width),
            height: Some(height),
        }
    }

    /// Unconstrained request: any camera, native format.
    pub fn minimal() -> Self {
        Self::default()
    }

    pub fn is_minimal(&self) -> bool {
        *self == Self::minimal()
    }
}

/// Opens camera streams. Implemented by device backends (V4L2) and test fakes.
pub trait CameraBackend: Send {
    fn open(&mut self, constraints: &StreamConstraints) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// A live, decoded video stream.
pub trait VideoStream: Send {
    /// Native (negotiated) resolution.
    fn resolution(&self) -> (u32, u32);

    /// False once the device went away or the stream was stopped.
    fn is_live(&self) -> bool;

    /// True when a decoded frame can be read without stalling on warm-up.
    fn has_frame_data(&self) -> bool;

    /// Read the most recent frame. Must not stop the stream, and should
    /// not wait on the device longer than it takes to copy a buffer.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Stop all tracks and release the device handle.
    fn stop(&mut self);
}

/// Lifecycle of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Stopped,
}

enum Session {
    Uninitialized,
    Active(Box<dyn VideoStream>),
    Stopped,
}

/// Exclusive owner of the camera session.
pub struct CameraResourceManager {
    backend: Box<dyn CameraBackend>,
    session: Session,
}

impl CameraResourceManager {
    pub fn new(backend: impl CameraBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            session: Session::Uninitialized,
        }
    }

    /// Acquire a stream, falling back to an unconstrained request when the
    /// preferred constraints cannot be satisfied. Returns the negotiated
    /// resolution.
    ///
    /// Any previously active stream is released first. On failure no stream
    /// is referenced.
    pub fn acquire(&mut self, preferred: &StreamConstraints) -> Result<(u32, u32), CameraError> {
        if matches!(self.session, Session::Active(_)) {
            tracing::debug!("acquire while active; releasing previous stream");
            self.release();
        }

        let stream = match self.backend.open(preferred) {
            Ok(stream) => stream,
            Err(err) if preferred.is_minimal() => return Err(err),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    ?preferred,
                    "preferred camera constraints failed; retrying unconstrained"
                );
                self.backend.open(&StreamConstraints::minimal())?
            }
        };

        let (width, height) = stream.resolution();
        tracing::info!(width, height, "camera stream acquired");
        self.session = Session::Active(stream);
        Ok((width, height))
    }

    /// Stop the stream if one is active. Safe to call any number of times;
    /// returns true only when a live stream was actually stopped.
    pub fn release(&mut self) -> bool {
        match std::mem::replace(&mut self.session, Session::Stopped) {
            Session::Active(mut stream) => {
                stream.stop();
                tracing::info!("camera stream released");
                true
            }
            Session::Uninitialized => {
                self.session = Session::Uninitialized;
                false
            }
            Session::Stopped => false,
        }
    }

    pub fn state(&self) -> SessionState {
        match self.session {
            Session::Uninitialized => SessionState::Uninitialized,
            Session::Active(_) => SessionState::Active,
            Session::Stopped => SessionState::Stopped,
        }
    }

    /// True while a stream is held and still delivering.
    pub fn is_streaming(&self) -> bool {
        match &self.session {
            Session::Active(stream) => stream.is_live(),
            _ => false,
        }
    }

    pub fn has_frame_data(&self) -> bool {
        match &self.session {
            Session::Active(stream) => stream.is_live() && stream.has_frame_data(),
            _ => false,
        }
    }

    /// Read a still from the live stream at native resolution.
    pub fn capture(&mut self) -> Result<Frame, CaptureError> {
        match &mut self.session {
            Session::Active(stream) if !stream.is_live() => Err(CaptureError::StreamEnded),
            Session::Active(stream) => stream.read_frame(),
            _ => Err(CaptureError::NotStreaming),
        }
    }
}

impl Drop for CameraResourceManager {
    fn drop(&mut self) {
        self.release();
    }
}
