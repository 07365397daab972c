//! What the presentation layer sees: the published view, one-shot events,
//! and the handle it drives the engine through.

use crate::error::EngineError;
use facegate_core::{Diagnostic, ModeKind, ValidationStatus};
use image::RgbImage;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Initializing,
    Ready,
    Capturing,
    RegisterPreview,
    Verifying,
    RetryReady,
    Confirmed,
    Failed,
    Closed,
}

/// Snapshot published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineView {
    pub mode: ModeKind,
    pub state: EngineState,
    /// Live guidance from the latest detection tick.
    pub status: ValidationStatus,
    /// Retry or failure message, cleared when a new attempt starts.
    pub message: Option<String>,
}

impl EngineView {
    pub(crate) fn initial(mode: ModeKind) -> Self {
        Self {
            mode,
            state: EngineState::Initializing,
            status: ValidationStatus::idle(),
            message: None,
        }
    }
}

/// Why a verification produced its result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCause {
    Compared(Diagnostic),
    /// The comparison itself errored; shown to the user as a mismatch.
    ComparisonFailed(String),
}

/// One-shot notifications, each delivered at most once per session.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Register mode: the user confirmed this normalized image.
    Confirmed(RgbImage),
    /// Verify mode: a comparison finished.
    Result {
        success: bool,
        score: Option<f32>,
        cause: ResultCause,
    },
    /// The session ended and the camera was released.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Capture,
    Retake,
    Confirm,
    Close,
}

/// Caller's end of a running engine. Dropping it closes the engine.
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    view: watch::Receiver<EngineView>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        view: watch::Receiver<EngineView>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            events,
            view,
            task,
        }
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Take a photo (register mode). Ignored in verify mode, where capture
    /// is automatic.
    pub fn capture(&self) -> Result<(), EngineError> {
        self.send(Command::Capture)
    }

    /// Discard the previewed photo and resume scanning.
    pub fn retake(&self) -> Result<(), EngineError> {
        self.send(Command::Retake)
    }

    /// Accept the previewed photo; emits [`EngineEvent::Confirmed`] and closes.
    pub fn confirm(&self) -> Result<(), EngineError> {
        self.send(Command::Confirm)
    }

    pub fn close(&self) -> Result<(), EngineError> {
        self.send(Command::Close)
    }

    /// Latest published view.
    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    /// A receiver that observes every view update.
    pub fn subscribe(&self) -> watch::Receiver<EngineView> {
        self.view.clone()
    }

    /// Wait until the published view satisfies `pred`.
    pub async fn wait_for(
        &mut self,
        pred: impl FnMut(&EngineView) -> bool,
    ) -> Result<EngineView, EngineError> {
        let view = self
            .view
            .wait_for(pred)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(view.clone())
    }

    /// Next event, or `None` once the engine has exited and all events
    /// were drained.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Close the engine if it is still running and wait for its task to
    /// finish. Undelivered events are discarded.
    pub async fn join(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "engine task did not exit cleanly");
        }
    }
}
