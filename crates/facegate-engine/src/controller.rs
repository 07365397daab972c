//! Mode controller: the one task that owns the camera, the detection loop
//! and the capture pipeline.
//!
//! Interval ticks, caller commands, the in-flight detection, the in-flight
//! comparison and the auto-close deadline are multiplexed in a single
//! `select!`. Each pending future belongs to the [`Phase`] that started it,
//! so leaving a phase drops its work unawaited and a late result has
//! nowhere to land.

use crate::auto_capture::AutoCapture;
use crate::config::EngineConfig;
use crate::error::{EngineError, RetryCause};
use crate::events::{Command, EngineEvent, EngineHandle, EngineState, EngineView, ResultCause};
use crate::scheduler::{self, DetectionLoop, TickOutcome, TickResult};
use facegate_core::{
    classify, normalizer, ComparisonError, DetectorError, Diagnostic, FaceComparator, FaceDetector,
    ModeKind, ScanMode, ValidationStatus, VerificationResult,
};
use facegate_hw::{CameraError, CameraResourceManager, CaptureError};
use image::RgbImage;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};

type PendingComparison =
    Pin<Box<dyn Future<Output = Result<VerificationResult, ComparisonError>> + Send>>;

/// Start an engine for `mode` on the current tokio runtime.
///
/// `load_detector` runs on the blocking pool; if it fails the camera is
/// never opened. The camera is acquired next, off the async workers, and
/// only then does the detection loop start.
pub fn spawn_engine<D, L>(
    config: &EngineConfig,
    mode: ScanMode,
    camera: CameraResourceManager,
    load_detector: L,
) -> EngineHandle
where
    D: FaceDetector,
    L: FnOnce() -> Result<D, DetectorError> + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(EngineView::initial(mode.kind()));

    let link = Link {
        commands: command_rx,
        events: event_tx,
        view: view_tx,
    };
    let task = tokio::spawn(run(config.clone(), mode, camera, load_detector, link));
    EngineHandle::new(command_tx, event_rx, view_rx, task)
}

/// The controller's side of the handle's channels.
struct Link {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
    view: watch::Sender<EngineView>,
}

impl Link {
    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event receiver gone; event dropped");
        }
    }

    fn set_state(&self, state: EngineState, message: Option<String>) {
        self.view.send_modify(|view| {
            view.state = state;
            view.message = message;
        });
    }

    /// Publish a status, waking watchers only when it changed.
    fn set_status(&self, status: ValidationStatus) {
        self.view.send_if_modified(|view| {
            if view.status == status {
                return false;
            }
            view.status = status;
            true
        });
    }

    /// Drive `work` to completion unless the caller closes first.
    async fn unless_closed<F: Future>(&mut self, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return None,
                    Some(other) => tracing::debug!(command = ?other, "command ignored while initializing"),
                },
            }
        }
    }

    async fn wait_for_close(&mut self) {
        while let Some(command) = self.commands.recv().await {
            if command == Command::Close {
                return;
            }
            tracing::debug!(command = ?command, "command ignored after failure");
        }
    }

    fn closed(&self) {
        self.set_state(EngineState::Closed, None);
        self.emit(EngineEvent::Closed);
        tracing::info!("engine closed");
    }
}

async fn run<D, L>(
    config: EngineConfig,
    mode: ScanMode,
    camera: CameraResourceManager,
    load_detector: L,
    mut link: Link,
) where
    D: FaceDetector,
    L: FnOnce() -> Result<D, DetectorError> + Send + 'static,
{
    tracing::info!(mode = ?mode.kind(), "engine starting");

    let detector = match link.unless_closed(tokio::task::spawn_blocking(load_detector)).await {
        None => return link.closed(),
        Some(Ok(Ok(detector))) => Arc::new(detector),
        Some(Ok(Err(err))) => return fail_startup(link, EngineError::ModelLoad(err)).await,
        Some(Err(join_err)) => {
            let err = DetectorError::Unavailable(join_err.to_string());
            return fail_startup(link, EngineError::ModelLoad(err)).await;
        }
    };
    tracing::info!("face detector ready");

    let constraints = config.stream_constraints();
    let mut acquire = tokio::task::spawn_blocking(move || {
        let mut camera = camera;
        let acquired = camera.acquire(&constraints);
        (camera, acquired)
    });
    let (camera, resolution) = match link.unless_closed(&mut acquire).await {
        None => {
            // The open cannot be interrupted; let it finish so the device is
            // free again before `Closed` goes out.
            if let Ok((mut camera, _)) = acquire.await {
                camera.release();
            }
            return link.closed();
        }
        Some(Ok((camera, Ok(resolution)))) => (camera, resolution),
        Some(Ok((_, Err(err)))) => return fail_startup(link, EngineError::Camera(err)).await,
        Some(Err(join_err)) => {
            let err = CameraError::Unknown(join_err.to_string());
            return fail_startup(link, EngineError::Camera(err)).await;
        }
    };
    tracing::info!(
        device = %config.camera_device,
        width = resolution.0,
        height = resolution.1,
        "camera ready"
    );

    Controller::new(config, mode, camera, detector, link).run().await;
}

/// Terminal failure before the controller existed: publish it, then wait
/// for the caller to close.
async fn fail_startup(mut link: Link, err: EngineError) {
    tracing::error!(error = %err, "engine failed to start");
    link.set_state(EngineState::Failed, Some(err.user_message()));
    link.wait_for_close().await;
    link.closed();
}

/// What the controller is doing. Work in flight lives inside the variant
/// that owns it.
enum Phase {
    /// `Ready` / `RetryReady`: the detection loop runs.
    Scanning(DetectionLoop),
    /// Register mode: the normalized photo awaits confirm or retake.
    Previewing(RgbImage),
    /// Verify mode: a comparison is in flight; no detection runs.
    Verifying(PendingComparison),
    /// Verify mode: matched, closing at the deadline.
    Confirmed { close_at: Instant },
    /// Nothing running: failed, or about to close.
    Stopped,
}

enum Event {
    Tick,
    Command(Option<Command>),
    Detected(TickResult),
    Compared(Result<VerificationResult, ComparisonError>),
    CloseDeadline,
}

/// Resolve the current phase's pending work. Never resolves for phases
/// with nothing in flight.
async fn phase_event(phase: &mut Phase) -> Event {
    match phase {
        Phase::Scanning(detection) => Event::Detected(detection.next_result().await),
        Phase::Verifying(comparison) => Event::Compared(comparison.as_mut().await),
        Phase::Confirmed { close_at } => {
            tokio::time::sleep_until(*close_at).await;
            Event::CloseDeadline
        }
        Phase::Previewing(_) | Phase::Stopped => std::future::pending().await,
    }
}

struct Controller<D: FaceDetector> {
    config: EngineConfig,
    mode: ScanMode,
    camera: CameraResourceManager,
    detector: Arc<D>,
    comparator: FaceComparator<D>,
    auto_capture: AutoCapture,
    ticker: Interval,
    phase: Phase,
    link: Link,
}

impl<D: FaceDetector> Controller<D> {
    fn new(
        config: EngineConfig,
        mode: ScanMode,
        camera: CameraResourceManager,
        detector: Arc<D>,
        link: Link,
    ) -> Self {
        let comparator = FaceComparator::new(
            Arc::clone(&detector),
            config.detect_options(),
            config.thresholds(),
            config.target_aspect,
        );
        Self {
            auto_capture: AutoCapture::new(config.dwell()),
            ticker: scheduler::ticker(config.poll_interval()),
            comparator,
            config,
            mode,
            camera,
            detector,
            phase: Phase::Stopped,
            link,
        }
    }

    async fn run(mut self) {
        self.scan(EngineState::Ready, None);

        loop {
            let scanning = matches!(self.phase, Phase::Scanning(_));
            let event = tokio::select! {
                biased;
                command = self.link.commands.recv() => Event::Command(command),
                event = phase_event(&mut self.phase) => event,
                _ = self.ticker.tick(), if scanning => Event::Tick,
            };
            if self.handle(event).is_break() {
                break;
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Command(None) => {
                tracing::info!("engine handle dropped; closing");
                return ControlFlow::Break(());
            }
            Event::Command(Some(command)) => return self.on_command(command),
            Event::Tick => self.on_tick(),
            Event::Detected(tick) => self.on_detection(tick),
            Event::Compared(result) => self.on_comparison(result),
            Event::CloseDeadline => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        let scanning = matches!(self.phase, Phase::Scanning(_));
        let previewing = matches!(self.phase, Phase::Previewing(_));
        match command {
            Command::Close => return ControlFlow::Break(()),
            Command::Capture if self.mode.kind() == ModeKind::Verify => {
                tracing::debug!("manual capture ignored; verify mode captures automatically");
            }
            Command::Capture if scanning => self.capture(),
            Command::Retake if previewing => {
                tracing::info!("photo discarded; retaking");
                self.scan(EngineState::Ready, None);
            }
            Command::Confirm if previewing => {
                if let Phase::Previewing(image) = std::mem::replace(&mut self.phase, Phase::Stopped) {
                    tracing::info!(width = image.width(), height = image.height(), "photo confirmed");
                    self.link.set_state(EngineState::Confirmed, None);
                    self.link.emit(EngineEvent::Confirmed(image));
                }
                return ControlFlow::Break(());
            }
            command => {
                tracing::debug!(?command, state = ?self.link.view.borrow().state, "command not applicable; ignored");
            }
        }
        ControlFlow::Continue(())
    }

    fn on_tick(&mut self) {
        let Phase::Scanning(detection) = &mut self.phase else {
            return;
        };
        match detection.tick(&mut self.camera, self.detector.as_ref(), self.config.detect_options()) {
            Ok(TickOutcome::Dispatched) => {}
            Ok(TickOutcome::Skipped(reason)) => tracing::trace!(?reason, "detection tick skipped"),
            Err(err) => self.fail(EngineError::Capture(err)),
        }
    }

    fn on_detection(&mut self, tick: TickResult) {
        let status = match tick.result {
            Ok(result) => classify(
                &result,
                tick.frame_width,
                tick.frame_height,
                self.mode.kind(),
                &self.config.tolerance(),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "face detection failed");
                ValidationStatus::detection_failed()
            }
        };
        tracing::debug!(status = ?status.kind, "detection tick");

        let verifying = matches!(self.phase, Phase::Verifying(_));
        let trigger = match self.mode {
            ScanMode::Register => false,
            ScanMode::Verify(_) => self.auto_capture.observe(&status, Instant::now(), verifying),
        };
        self.link.set_status(status);
        if trigger {
            self.capture();
        }
    }

    /// Take a still, normalize it, and move to preview or verification.
    /// Leaving `Scanning` drops the detection loop and any in-flight tick.
    fn capture(&mut self) {
        self.phase = Phase::Stopped;
        self.auto_capture.reset();
        self.link.set_state(EngineState::Capturing, None);

        let frame = match self.camera.capture() {
            Ok(frame) => frame,
            Err(err @ (CaptureError::StreamEnded | CaptureError::NotStreaming)) => {
                return self.fail(EngineError::Capture(err));
            }
            Err(err) => return self.retry(RetryCause::Capture(err)),
        };
        let image = match normalizer::crop(&frame.image, self.config.target_aspect) {
            Ok(image) => image,
            Err(err) => return self.retry(RetryCause::Crop(err)),
        };
        tracing::info!(
            sequence = frame.sequence,
            width = image.width(),
            height = image.height(),
            "photo captured"
        );

        match &self.mode {
            ScanMode::Register => {
                self.phase = Phase::Previewing(image);
                self.link.set_state(EngineState::RegisterPreview, None);
            }
            ScanMode::Verify(reference) => {
                let comparator = self.comparator.clone();
                let reference = reference.clone();
                let candidate = Arc::new(image);
                self.phase = Phase::Verifying(Box::pin(async move {
                    comparator.compare(&reference, candidate).await
                }));
                self.link.set_state(EngineState::Verifying, None);
            }
        }
    }

    fn on_comparison(&mut self, result: Result<VerificationResult, ComparisonError>) {
        match result {
            Ok(result) if result.success => {
                tracing::info!(
                    similarity = result.score,
                    confidence = result.confidence,
                    "verification matched"
                );
                self.link.emit(EngineEvent::Result {
                    success: true,
                    score: Some(result.score),
                    cause: ResultCause::Compared(result.diagnostic),
                });
                self.camera.release();
                self.phase = Phase::Confirmed {
                    close_at: Instant::now() + self.config.confirm_close_delay(),
                };
                self.link.set_state(EngineState::Confirmed, None);
            }
            Ok(result) => {
                tracing::info!(
                    similarity = result.score,
                    confidence = result.confidence,
                    diagnostic = ?result.diagnostic,
                    "verification rejected"
                );
                self.link.emit(EngineEvent::Result {
                    success: false,
                    score: Some(result.score),
                    cause: ResultCause::Compared(result.diagnostic),
                });
                let message = rejection_message(result.diagnostic).to_string();
                self.scan(EngineState::RetryReady, Some(message));
            }
            Err(err) => {
                self.link.emit(EngineEvent::Result {
                    success: false,
                    score: None,
                    cause: ResultCause::ComparisonFailed(err.to_string()),
                });
                self.retry(RetryCause::Comparison(err));
            }
        }
    }

    /// (Re)start the detection loop with a fresh dwell timer.
    fn scan(&mut self, state: EngineState, message: Option<String>) {
        self.auto_capture.reset();
        self.ticker.reset();
        self.phase = Phase::Scanning(DetectionLoop::new());
        self.link.set_status(ValidationStatus::detecting());
        self.link.set_state(state, message);
    }

    fn retry(&mut self, cause: RetryCause) {
        tracing::warn!(error = %cause, "capture attempt aborted");
        self.scan(EngineState::RetryReady, Some(cause.user_message().to_string()));
    }

    fn fail(&mut self, err: EngineError) {
        tracing::error!(error = %err, "session failed");
        self.phase = Phase::Stopped;
        self.auto_capture.reset();
        self.camera.release();
        self.link.set_status(ValidationStatus::idle());
        self.link.set_state(EngineState::Failed, Some(err.user_message()));
    }

    fn shutdown(mut self) {
        self.phase = Phase::Stopped;
        self.auto_capture.reset();
        self.camera.release();
        self.link.closed();
    }
}

fn rejection_message(diagnostic: Diagnostic) -> &'static str {
    match diagnostic {
        Diagnostic::NoFaceDetected => "No face was found in the photo. Please try again.",
        Diagnostic::MultipleFacesDetected => {
            "More than one face was found in the photo. Please try again."
        }
        Diagnostic::Mismatch | Diagnostic::Match => {
            "The face does not match the registered photo. Please try again."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centered_face, face_at, reference_png, ScriptedCamera, ScriptedDetector};
    use facegate_core::ReferenceImage;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const FRAME: (u32, u32) = (640, 480);
    const CANDIDATE: (u32, u32) = (360, 480);
    const REFERENCE: (u32, u32) = (300, 400);

    fn start(config: &EngineConfig, mode: ScanMode, camera: ScriptedCamera, detector: ScriptedDetector) -> EngineHandle {
        spawn_engine(config, mode, CameraResourceManager::new(camera), move || Ok(detector))
    }

    fn verify_mode() -> ScanMode {
        ScanMode::Verify(reference_png(REFERENCE.0, REFERENCE.1))
    }

    async fn next_result(engine: &mut EngineHandle) -> (bool, Option<f32>, ResultCause) {
        match engine.next_event().await {
            Some(EngineEvent::Result { success, score, cause }) => (success, score, cause),
            other => panic!("expected a result event, got {other:?}"),
        }
    }

    async fn expect_closed(engine: &mut EngineHandle) {
        assert!(matches!(engine.next_event().await, Some(EngineEvent::Closed)));
        assert!(engine.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_capture_preview_confirm() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, _) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let mut engine = start(&EngineConfig::default(), ScanMode::Register, camera, detector);

        let view = engine.wait_for(|v| v.status.is_valid()).await.unwrap();
        assert_eq!(view.state, EngineState::Ready);
        assert_eq!(view.mode, ModeKind::Register);

        engine.capture().unwrap();
        engine.wait_for(|v| v.state == EngineState::RegisterPreview).await.unwrap();
        engine.confirm().unwrap();

        match engine.next_event().await {
            Some(EngineEvent::Confirmed(image)) => assert_eq!(image.dimensions(), CANDIDATE),
            other => panic!("expected confirmed image, got {other:?}"),
        }
        expect_closed(&mut engine).await;
        assert_eq!(cam.stops.load(Ordering::SeqCst), 1);
        assert_eq!(engine.view().state, EngineState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_retake_resumes_detection() {
        let (camera, _) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, probe) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let mut engine = start(&EngineConfig::default(), ScanMode::Register, camera, detector);

        engine.wait_for(|v| v.status.is_valid()).await.unwrap();
        engine.capture().unwrap();
        engine.wait_for(|v| v.state == EngineState::RegisterPreview).await.unwrap();

        // The loop is stopped while previewing.
        let calls = probe.calls_with(FRAME);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(probe.calls_with(FRAME), calls);

        engine.retake().unwrap();
        engine.wait_for(|v| v.state == EngineState::Ready).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(probe.calls_with(FRAME) > calls);

        // A second capture works after retake.
        engine.capture().unwrap();
        engine.wait_for(|v| v.state == EngineState::RegisterPreview).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_match_reports_once_and_auto_closes() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, probe) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let config = EngineConfig::default();
        let started = Instant::now();
        let mut engine = start(&config, verify_mode(), camera, detector);

        let (success, score, cause) = next_result(&mut engine).await;
        let matched_at = Instant::now();
        assert!(success);
        assert!(score.unwrap() > 0.99);
        assert_eq!(cause, ResultCause::Compared(Diagnostic::Match));
        assert!(matched_at - started >= config.dwell());
        assert_eq!(engine.view().state, EngineState::Confirmed);

        expect_closed(&mut engine).await;
        assert!(Instant::now() - matched_at >= config.confirm_close_delay());
        assert_eq!(probe.calls_with(REFERENCE), 1);
        assert_eq!(probe.calls_with(CANDIDATE), 1);
        assert_eq!(cam.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_no_face_in_candidate_retries() {
        let (camera, _) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, probe) = ScriptedDetector::new(|img| {
            if img.dimensions() == CANDIDATE {
                Ok(vec![])
            } else {
                Ok(vec![centered_face(img)])
            }
        });
        let config = EngineConfig::default();
        let mut engine = start(&config, verify_mode(), camera, detector);

        let (success, score, cause) = next_result(&mut engine).await;
        let first = Instant::now();
        assert!(!success);
        assert_eq!(score, Some(0.0));
        assert_eq!(cause, ResultCause::Compared(Diagnostic::NoFaceDetected));

        let view = engine.wait_for(|v| v.state == EngineState::RetryReady).await.unwrap();
        assert!(view.message.is_some());

        // The loop resumed and the dwell timer restarted from zero.
        let calls = probe.calls_with(FRAME);
        let (success, _, _) = next_result(&mut engine).await;
        assert!(!success);
        assert!(probe.calls_with(FRAME) > calls);
        assert!(Instant::now() - first >= config.dwell());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_mismatch_is_reported() {
        let (camera, _) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, _) = ScriptedDetector::new(|img| {
            let mut face = centered_face(img);
            if img.dimensions() == CANDIDATE {
                if let Some(lms) = face.landmarks.as_mut() {
                    lms[3].0 -= 30.0;
                    lms[4].0 += 30.0;
                }
            }
            Ok(vec![face])
        });
        let mut engine = start(&EngineConfig::default(), verify_mode(), camera, detector);

        let (success, score, cause) = next_result(&mut engine).await;
        assert!(!success);
        assert!(score.unwrap() < 0.9);
        assert_eq!(cause, ResultCause::Compared(Diagnostic::Mismatch));
        engine.wait_for(|v| v.state == EngineState::RetryReady).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_permission_denied_is_terminal() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let camera = camera.failing(CameraError::PermissionDenied);
        let (detector, probe) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let mut engine = start(&EngineConfig::default(), verify_mode(), camera, detector);

        let view = engine.wait_for(|v| v.state == EngineState::Failed).await.unwrap();
        assert_eq!(view.message, Some(CameraError::PermissionDenied.to_string()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(probe.total_calls(), 0);
        assert_eq!(engine.view().state, EngineState::Failed);
        // Preferred constraints, then the unconstrained fallback.
        assert_eq!(cam.opens.load(Ordering::SeqCst), 2);

        engine.close().unwrap();
        expect_closed(&mut engine).await;
        assert_eq!(cam.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_load_failure_never_opens_camera() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let mut engine = spawn_engine(
            &EngineConfig::default(),
            ScanMode::Register,
            CameraResourceManager::new(camera),
            || -> Result<ScriptedDetector, DetectorError> {
                Err(DetectorError::ModelNotFound("det_10g.onnx".into()))
            },
        );

        let view = engine.wait_for(|v| v.state == EngineState::Failed).await.unwrap();
        assert!(view.message.unwrap().contains("reopen"));
        assert_eq!(cam.opens.load(Ordering::SeqCst), 0);

        engine.close().unwrap();
        expect_closed(&mut engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_detection_or_second_capture_while_verifying() {
        let (camera, _) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let gate = Arc::new(Semaphore::new(0));
        let (detector, probe) = ScriptedDetector::new(|img| {
            if img.dimensions() == CANDIDATE {
                Ok(vec![])
            } else {
                Ok(vec![centered_face(img)])
            }
        });
        let detector = detector.gated(REFERENCE, gate.clone());
        let mut engine = start(&EngineConfig::default(), verify_mode(), camera, detector);

        engine.wait_for(|v| v.state == EngineState::Verifying).await.unwrap();
        let ticks = probe.calls_with(FRAME);

        // Valid faces would keep arriving, but nothing runs while verifying.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.calls_with(FRAME), ticks);
        assert_eq!(probe.calls_with(REFERENCE), 1);
        assert_eq!(engine.view().state, EngineState::Verifying);

        // Once the comparison finishes, detection resumes.
        gate.add_permits(1);
        let (success, _, _) = next_result(&mut engine).await;
        assert!(!success);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(probe.calls_with(FRAME) > ticks);
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_verifying_drops_late_result() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let gate = Arc::new(Semaphore::new(0));
        let (detector, probe) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let detector = detector.gated(REFERENCE, gate.clone());
        let mut engine = start(&EngineConfig::default(), verify_mode(), camera, detector);

        engine.wait_for(|v| v.state == EngineState::Verifying).await.unwrap();
        engine.close().unwrap();
        gate.add_permits(1);

        expect_closed(&mut engine).await;
        assert_eq!(probe.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(cam.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_comparison_error_is_reported_and_retried() {
        let (camera, _) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, probe) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let config = EngineConfig::default();
        let reference = ReferenceImage::from_bytes(vec![1, 2, 3]);
        let mut engine = start(&config, ScanMode::Verify(reference), camera, detector);

        let (success, score, cause) = next_result(&mut engine).await;
        let first = Instant::now();
        assert!(!success);
        assert_eq!(score, None);
        assert!(matches!(cause, ResultCause::ComparisonFailed(_)), "cause = {cause:?}");

        let view = engine.wait_for(|v| v.state == EngineState::RetryReady).await.unwrap();
        assert_eq!(
            view.message.as_deref(),
            Some("Verification could not be completed. Please try again.")
        );
        assert_eq!(probe.calls_with(CANDIDATE), 0);

        // Recoverable: the loop resumes and the next attempt runs after a full dwell.
        let (success, _, cause) = next_result(&mut engine).await;
        assert!(!success);
        assert!(matches!(cause, ResultCause::ComparisonFailed(_)));
        assert!(Instant::now() - first >= config.dwell());
    }

    #[tokio::test]
    async fn test_close_during_acquisition_releases_camera_first() {
        let (open_tx, open_rx) = std::sync::mpsc::channel();
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let camera = camera.held_open(open_rx);
        let (detector, probe) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let mut engine = start(&EngineConfig::default(), ScanMode::Register, camera, detector);

        while cam.opens.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        engine.close().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The device is still opening, so the session cannot be closed yet.
        assert_ne!(engine.view().state, EngineState::Closed);

        open_tx.send(()).unwrap();
        expect_closed(&mut engine).await;
        assert_eq!(cam.stops.load(Ordering::SeqCst), 1);
        assert_eq!(probe.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_capture_ignored_in_verify_mode() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, probe) = ScriptedDetector::new(|_| Ok(vec![]));
        let mut engine = start(&EngineConfig::default(), verify_mode(), camera, detector);

        engine.wait_for(|v| v.status.kind == facegate_core::ValidationKind::NoFace).await.unwrap();
        let reads = cam.reads.load(Ordering::SeqCst);
        engine.capture().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.view().state, EngineState::Ready);
        assert_eq!(cam.reads.load(Ordering::SeqCst), reads);
        assert_eq!(probe.calls_with(REFERENCE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_center_face_never_triggers_capture() {
        let (camera, _) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, probe) =
            ScriptedDetector::new(|img| Ok(vec![face_at(0.2, 0.5, img.width(), img.height(), 0.9)]));
        let mut engine = start(&EngineConfig::default(), verify_mode(), camera, detector);

        let view = engine
            .wait_for(|v| v.status.kind == facegate_core::ValidationKind::OffCenter)
            .await
            .unwrap();
        assert_eq!(view.state, EngineState::Ready);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.calls_with(REFERENCE), 0);
        assert_eq!(engine.view().state, EngineState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_error_is_per_tick() {
        let (camera, _) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, probe) =
            ScriptedDetector::new(|_| Err(DetectorError::InferenceFailed("scripted".into())));
        let mut engine = start(&EngineConfig::default(), ScanMode::Register, camera, detector);

        let view = engine
            .wait_for(|v| v.status.kind == facegate_core::ValidationKind::Error)
            .await
            .unwrap();
        assert_eq!(view.state, EngineState::Ready);
        let calls = probe.total_calls();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(probe.total_calls() > calls);
        assert_eq!(engine.view().state, EngineState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crop_failure_returns_to_retry_ready() {
        // A 100x1 stream cannot be cropped to 0.4.
        let (camera, _) = ScriptedCamera::new(100, 1);
        let (detector, _) = ScriptedDetector::new(|_| Ok(vec![]));
        let config = EngineConfig {
            target_aspect: 0.4,
            ..EngineConfig::default()
        };
        let mut engine = start(&config, ScanMode::Register, camera, detector);

        engine.wait_for(|v| v.state == EngineState::Ready).await.unwrap();
        engine.capture().unwrap();
        let view = engine.wait_for(|v| v.state == EngineState::RetryReady).await.unwrap();
        assert_eq!(
            view.message.as_deref(),
            Some("The photo could not be processed. Please try again.")
        );

        engine.close().unwrap();
        // No confirmed image was ever emitted.
        expect_closed(&mut engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_loss_fails_session() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, _) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let mut engine = start(&EngineConfig::default(), ScanMode::Register, camera, detector);

        engine.wait_for(|v| v.status.is_valid()).await.unwrap();
        cam.lost.store(true, Ordering::SeqCst);

        let view = engine.wait_for(|v| v.state == EngineState::Failed).await.unwrap();
        assert!(view.message.unwrap().contains("reopen"));
        assert_eq!(cam.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_releases_camera() {
        let (camera, cam) = ScriptedCamera::new(FRAME.0, FRAME.1);
        let (detector, _) = ScriptedDetector::new(|img| Ok(vec![centered_face(img)]));
        let mut engine = start(&EngineConfig::default(), ScanMode::Register, camera, detector);

        engine.wait_for(|v| v.state == EngineState::Ready).await.unwrap();
        engine.join().await;
        assert_eq!(cam.stops.load(Ordering::SeqCst), 1);
    }
}
