//! Scripted camera and detector used by the engine's tests.

use facegate_core::{BoundingBox, DetectFuture, DetectOptions, DetectorError, FaceDetector, Landmarks, ReferenceImage};
use facegate_hw::{CameraBackend, CameraError, CaptureError, Frame, StreamConstraints, VideoStream};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tokio::sync::Semaphore;

/// Observable side of a [`ScriptedCamera`]; flip the flags to change what
/// the open stream delivers.
#[derive(Default)]
pub(crate) struct CameraProbe {
    pub opens: AtomicUsize,
    pub stops: AtomicUsize,
    pub reads: AtomicUsize,
    pub lost: AtomicBool,
    pub dark: AtomicBool,
    pub warming_up: AtomicBool,
    pub read_error: AtomicBool,
}

pub(crate) struct ScriptedCamera {
    probe: Arc<CameraProbe>,
    open_error: Option<CameraError>,
    open_gate: Option<mpsc::Receiver<()>>,
    width: u32,
    height: u32,
}

impl ScriptedCamera {
    pub fn new(width: u32, height: u32) -> (Self, Arc<CameraProbe>) {
        let probe = Arc::new(CameraProbe::default());
        let camera = Self {
            probe: probe.clone(),
            open_error: None,
            open_gate: None,
            width,
            height,
        };
        (camera, probe)
    }

    /// Every open fails with `err`.
    pub fn failing(mut self, err: CameraError) -> Self {
        self.open_error = Some(err);
        self
    }

    /// Each open blocks until a message arrives on `gate` (or its sender
    /// is dropped), like a slow device.
    pub fn held_open(mut self, gate: mpsc::Receiver<()>) -> Self {
        self.open_gate = Some(gate);
        self
    }
}

impl CameraBackend for ScriptedCamera {
    fn open(&mut self, _constraints: &StreamConstraints) -> Result<Box<dyn VideoStream>, CameraError> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.open_gate {
            let _ = gate.recv();
        }
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        Ok(Box::new(ScriptedStream {
            probe: self.probe.clone(),
            width: self.width,
            height: self.height,
            sequence: 0,
            stopped: false,
        }))
    }
}

struct ScriptedStream {
    probe: Arc<CameraProbe>,
    width: u32,
    height: u32,
    sequence: u32,
    stopped: bool,
}

impl VideoStream for ScriptedStream {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_live(&self) -> bool {
        !self.stopped && !self.probe.lost.load(Ordering::SeqCst)
    }

    fn has_frame_data(&self) -> bool {
        !self.probe.warming_up.load(Ordering::SeqCst)
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.probe.lost.load(Ordering::SeqCst) {
            return Err(CaptureError::StreamEnded);
        }
        if self.probe.read_error.load(Ordering::SeqCst) {
            return Err(CaptureError::ReadFailed("scripted read failure".into()));
        }
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        let level = if self.probe.dark.load(Ordering::SeqCst) { 0 } else { 128 };
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([level; 3]));
        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
    }
}

type Script = dyn Fn(&RgbImage) -> Result<Vec<BoundingBox>, DetectorError> + Send + Sync;

#[derive(Default)]
pub(crate) struct DetectorProbe {
    /// Dimensions of every image passed to `detect`, in call order.
    pub calls: Mutex<Vec<(u32, u32)>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl DetectorProbe {
    pub fn calls_with(&self, dims: (u32, u32)) -> usize {
        self.calls.lock().unwrap().iter().filter(|&&d| d == dims).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

struct InFlight(Arc<DetectorProbe>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Detector whose answer is a function of the input image. With a gate,
/// each call on an image of the gated size waits for one permit before
/// answering.
pub(crate) struct ScriptedDetector {
    script: Box<Script>,
    probe: Arc<DetectorProbe>,
    gate: Option<((u32, u32), Arc<Semaphore>)>,
}

impl ScriptedDetector {
    pub fn new(
        script: impl Fn(&RgbImage) -> Result<Vec<BoundingBox>, DetectorError> + Send + Sync + 'static,
    ) -> (Self, Arc<DetectorProbe>) {
        let probe = Arc::new(DetectorProbe::default());
        let detector = Self {
            script: Box::new(script),
            probe: probe.clone(),
            gate: None,
        };
        (detector, probe)
    }

    pub fn gated(mut self, dims: (u32, u32), gate: Arc<Semaphore>) -> Self {
        self.gate = Some((dims, gate));
        self
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&self, image: Arc<RgbImage>, _options: DetectOptions) -> DetectFuture {
        self.probe.calls.lock().unwrap().push(image.dimensions());
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(self.probe.clone());

        let result = (self.script)(&image);
        let gate = self
            .gate
            .as_ref()
            .filter(|(dims, _)| *dims == image.dimensions())
            .map(|(_, gate)| gate.clone());
        Box::pin(async move {
            let _guard = guard;
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            result
        })
    }
}

/// Canonical five-point layout inside a unit box.
const UNIT_LANDMARKS: Landmarks = [
    (0.34, 0.46),
    (0.66, 0.46),
    (0.50, 0.64),
    (0.37, 0.82),
    (0.63, 0.82),
];

/// A face whose box is centered at (`cx`, `cy`) as fractions of a
/// `width`x`height` image, with landmarks of the canonical layout.
pub(crate) fn face_at(cx: f32, cy: f32, width: u32, height: u32, confidence: f32) -> BoundingBox {
    let (w, h) = (width as f32 * 0.3, height as f32 * 0.4);
    let x = cx * width as f32 - w / 2.0;
    let y = cy * height as f32 - h / 2.0;
    BoundingBox {
        x,
        y,
        width: w,
        height: h,
        confidence,
        landmarks: Some(UNIT_LANDMARKS.map(|(lx, ly)| (x + lx * w, y + ly * h))),
    }
}

pub(crate) fn centered_face(image: &RgbImage) -> BoundingBox {
    face_at(0.5, 0.5, image.width(), image.height(), 0.9)
}

/// PNG-encoded reference still of the given size.
pub(crate) fn reference_png(width: u32, height: u32) -> ReferenceImage {
    let img = RgbImage::from_pixel(width, height, Rgb([140, 120, 100]));
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    ReferenceImage::from_bytes(bytes)
}
