//! Fixed-period detection loop.
//!
//! A [`DetectionLoop`] only exists while the controller is scanning, so a
//! loop that is not enabled is simply absent. The in-flight detection is
//! the busy latch: a tick is dispatched only when none is pending, and the
//! latch clears when the result is taken or the loop is dropped.

use facegate_core::{detect_frame, DetectOptions, DetectionFrameResult, DetectorError, FaceDetector};
use facegate_hw::{CameraResourceManager, CaptureError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

type PendingDetection = Pin<Box<dyn Future<Output = Result<DetectionFrameResult, DetectorError>> + Send>>;

/// Interval driving the loop. Ticks missed while the controller was busy
/// are skipped, not burst.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Why a tick did not dispatch detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous tick's detection is still running.
    InFlight,
    /// The stream has not produced decodable frames yet.
    NoFrameData,
    /// The frame was (almost) black.
    DarkFrame,
    /// Reading the frame failed; the next tick tries again.
    ReadFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Dispatched,
    Skipped(SkipReason),
}

/// Output of one completed tick, with the dimensions of the frame it ran on.
#[derive(Debug)]
pub struct TickResult {
    pub frame_width: u32,
    pub frame_height: u32,
    pub result: Result<DetectionFrameResult, DetectorError>,
}

struct InFlight {
    frame_width: u32,
    frame_height: u32,
    detection: PendingDetection,
}

#[derive(Default)]
pub struct DetectionLoop {
    in_flight: Option<InFlight>,
}

impl DetectionLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Run one tick: capture a frame and dispatch detection on it, unless
    /// the tick has to be skipped.
    ///
    /// Only a lost stream is an error; the caller fails the session on it.
    pub fn tick<D: FaceDetector + ?Sized>(
        &mut self,
        camera: &mut CameraResourceManager,
        detector: &D,
        options: DetectOptions,
    ) -> Result<TickOutcome, CaptureError> {
        if self.in_flight.is_some() {
            return Ok(TickOutcome::Skipped(SkipReason::InFlight));
        }
        if !camera.is_streaming() {
            return Err(CaptureError::StreamEnded);
        }
        if !camera.has_frame_data() {
            return Ok(TickOutcome::Skipped(SkipReason::NoFrameData));
        }

        let frame = match camera.capture() {
            Ok(frame) => frame,
            Err(err @ (CaptureError::StreamEnded | CaptureError::NotStreaming)) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "frame read failed; skipping tick");
                return Ok(TickOutcome::Skipped(SkipReason::ReadFailed));
            }
        };
        if frame.is_dark {
            tracing::trace!(sequence = frame.sequence, "dark frame; skipping tick");
            return Ok(TickOutcome::Skipped(SkipReason::DarkFrame));
        }

        let (frame_width, frame_height) = (frame.width(), frame.height());
        tracing::trace!(sequence = frame.sequence, width = frame_width, height = frame_height, "dispatching detection");
        let detection = detect_frame(detector, Arc::new(frame.image), options);
        self.in_flight = Some(InFlight {
            frame_width,
            frame_height,
            detection: Box::pin(detection),
        });
        Ok(TickOutcome::Dispatched)
    }

    /// Wait for the in-flight detection and take its result, clearing the
    /// busy latch whether it succeeded or failed. Never resolves while idle.
    ///
    /// Cancel-safe: if this future is dropped, the detection stays pending.
    pub async fn next_result(&mut self) -> TickResult {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let result = in_flight.detection.as_mut().await;
        let (frame_width, frame_height) = (in_flight.frame_width, in_flight.frame_height);
        self.in_flight = None;
        TickResult {
            frame_width,
            frame_height,
            result,
        }
    }
}
