//! Dwell timer that turns a sustained `Valid` status into one capture.

use facegate_core::ValidationStatus;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks how long the face has been continuously valid.
#[derive(Debug)]
pub struct AutoCapture {
    dwell: Duration,
    valid_since: Option<Instant>,
}

impl AutoCapture {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            valid_since: None,
        }
    }

    /// Feed one published status. Returns true exactly when a capture
    /// should be triggered; the timer is cleared at that point, so the next
    /// trigger needs a fresh full dwell.
    ///
    /// While `verifying`, nothing is recorded and nothing fires.
    pub fn observe(&mut self, status: &ValidationStatus, now: Instant, verifying: bool) -> bool {
        if verifying {
            return false;
        }
        if !status.is_valid() {
            if self.valid_since.take().is_some() {
                tracing::trace!(status = ?status.kind, "auto-capture timer reset");
            }
            return false;
        }

        match self.valid_since {
            None => {
                self.valid_since = Some(now);
                false
            }
            Some(since) if now.saturating_duration_since(since) >= self.dwell => {
                self.valid_since = None;
                tracing::debug!(dwell_ms = self.dwell.as_millis() as u64, "auto-capture triggered");
                true
            }
            Some(_) => false,
        }
    }

    pub fn reset(&mut self) {
        self.valid_since = None;
    }

    pub fn is_armed(&self) -> bool {
        self.valid_since.is_some()
    }
}
