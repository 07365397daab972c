//! V4L2 camera backend via the `v4l` crate.

use crate::camera::{CameraBackend, CameraError, CaptureError, StreamConstraints, VideoStream};
use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const MMAP_BUFFERS: u32 = 4;

/// Upper bound on one blocking dequeue, so the capture thread can notice
/// a stop request even when the sensor stalls.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a failed dequeue that returned immediately.
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (native IR camera output).
    Grey,
    /// Packed 24-bit RGB.
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb3)
        } else {
            None
        }
    }
}

/// Opens `/dev/videoN` capture streams.
pub struct V4l2Backend {
    device_path: String,
    warmup_frames: usize,
}

impl V4l2Backend {
    pub fn new(device_path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames,
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CameraBackend for V4l2Backend {
    fn open(&mut self, constraints: &StreamConstraints) -> Result<Box<dyn VideoStream>, CameraError> {
        let stream = V4l2Stream::open(&self.device_path, constraints, self.warmup_frames)?;
        Ok(Box::new(stream))
    }
}

/// Map an OS error from opening or configuring the device onto the
/// acquisition taxonomy.
fn map_open_error(device_path: &str, err: &io::Error) -> CameraError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied,
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.to_string()),
        _ => match err.raw_os_error() {
            Some(libc::EBUSY) => CameraError::DeviceBusy,
            Some(libc::ENODEV) | Some(libc::ENXIO) => {
                CameraError::DeviceNotFound(device_path.to_string())
            }
            _ => CameraError::Unknown(format!("{device_path}: {err}")),
        },
    }
}

/// Newest buffer handed over by the capture thread.
#[derive(Default)]
struct Latest {
    raw: Option<Vec<u8>>,
    sequence: u32,
    /// Set when the newest dequeue attempt failed; cleared by the next frame.
    error: Option<String>,
    lost: bool,
}

/// Single-slot mailbox between the capture thread and readers. Each
/// published frame replaces the previous one, so a reader always sees the
/// most recent buffer the driver delivered.
#[derive(Default)]
struct FrameSlot {
    latest: Mutex<Latest>,
}

impl FrameSlot {
    fn lock(&self) -> MutexGuard<'_, Latest> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, buf: &[u8], sequence: u32) {
        let mut latest = self.lock();
        let raw = latest.raw.get_or_insert_with(Vec::new);
        raw.clear();
        raw.extend_from_slice(buf);
        latest.sequence = sequence;
        latest.error = None;
    }

    fn record_error(&self, message: String) {
        self.lock().error = Some(message);
    }

    fn mark_lost(&self) {
        self.lock().lost = true;
    }

    fn is_lost(&self) -> bool {
        self.lock().lost
    }

    fn has_frame(&self) -> bool {
        let latest = self.lock();
        !latest.lost && latest.raw.is_some()
    }

    /// Copy out the newest buffer. A pending dequeue error is reported once.
    fn read(&self) -> Result<(Vec<u8>, u32), CaptureError> {
        let mut latest = self.lock();
        if latest.lost {
            return Err(CaptureError::StreamEnded);
        }
        if let Some(message) = latest.error.take() {
            return Err(CaptureError::ReadFailed(message));
        }
        match &latest.raw {
            Some(raw) => Ok((raw.clone(), latest.sequence)),
            None => Err(CaptureError::ReadFailed("no frame dequeued yet".into())),
        }
    }
}

/// A streaming V4L2 device. A dedicated thread dequeues every buffer as
/// the driver fills it and keeps only the newest, so reads never block on
/// the device and never return a frame older than one frame interval.
pub struct V4l2Stream {
    slot: Arc<FrameSlot>,
    stop_requested: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    device_path: String,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4l2Stream {
    fn open(
        device_path: &str,
        constraints: &StreamConstraints,
        warmup_frames: usize,
    ) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device =
            Device::with_path(device_path).map_err(|e| map_open_error(device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| map_open_error(device_path, &e))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::Unknown(format!(
                "{device_path} is not a video capture device"
            )));
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if let Some(facing) = constraints.facing {
            // V4L2 exposes no facing metadata; the configured device is used as-is.
            tracing::debug!(?facing, "facing constraint not enforceable on V4L2");
        }

        let mut fmt = device
            .format()
            .map_err(|e| map_open_error(device_path, &e))?;

        let negotiated = match (constraints.width, constraints.height) {
            (Some(width), Some(height)) => {
                fmt.fourcc = FourCC::new(b"YUYV");
                fmt.width = width;
                fmt.height = height;
                device
                    .set_format(&fmt)
                    .map_err(|e| map_open_error(device_path, &e))?
            }
            // Unconstrained: keep whatever the driver currently delivers.
            _ => fmt,
        };

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::Unknown(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or RGB3)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| map_open_error(device_path, &e))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        // The first dequeue starts streaming, so a busy or stalled device
        // fails acquisition instead of the first read.
        let slot = Arc::new(FrameSlot::default());
        match stream.next() {
            Ok((buf, meta)) if warmup_frames == 0 => slot.publish(buf, meta.sequence),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(CameraError::Unknown(format!(
                    "{device_path}: no frame within {DEQUEUE_TIMEOUT:?}"
                )));
            }
            Err(e) => return Err(map_open_error(device_path, &e)),
        }
        if warmup_frames > 0 {
            tracing::debug!(count = warmup_frames, "discarding warmup frames");
        }

        let stop_requested = Arc::new(AtomicBool::new(false));
        let worker = {
            let slot = Arc::clone(&slot);
            let stop_requested = Arc::clone(&stop_requested);
            let device_path = device_path.to_string();
            let warmup = warmup_frames.saturating_sub(1);
            std::thread::Builder::new()
                .name("facegate-capture".into())
                .spawn(move || {
                    capture_loop(device, stream, &slot, &stop_requested, warmup, &device_path)
                })
                .map_err(|e| CameraError::Unknown(format!("failed to spawn capture thread: {e}")))?
        };

        Ok(Self {
            slot,
            stop_requested,
            worker: Some(worker),
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<image::RgbImage, CaptureError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
            PixelFormat::Rgb3 => frame::rgb24_to_rgb(buf, self.width, self.height),
        };
        converted.map_err(|e| CaptureError::ReadFailed(format!("{:?} conversion: {e}", self.pixel_format)))
    }
}

/// Body of the capture thread: dequeue continuously until asked to stop or
/// the device goes away. Warmup frames are dropped for AGC/AE to settle.
fn capture_loop(
    _device: Device,
    mut stream: MmapStream<'static>,
    slot: &FrameSlot,
    stop_requested: &AtomicBool,
    warmup_frames: usize,
    device_path: &str,
) {
    let mut discarded = 0usize;
    while !stop_requested.load(Ordering::Acquire) {
        match stream.next() {
            Ok((buf, meta)) => {
                if discarded < warmup_frames {
                    discarded += 1;
                    tracing::trace!(sequence = meta.sequence, "discarding warmup frame");
                    continue;
                }
                slot.publish(buf, meta.sequence);
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENODEV) | Some(libc::EIO)) => {
                tracing::warn!(device = device_path, error = %e, "camera stream lost");
                slot.mark_lost();
                break;
            }
            Err(e) => {
                tracing::debug!(device = device_path, error = %e, "dequeue failed");
                slot.record_error(format!("failed to dequeue buffer: {e}"));
                if e.kind() != io::ErrorKind::TimedOut {
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }
    if let Err(e) = stream.stop() {
        tracing::warn!(device = device_path, error = %e, "failed to stop stream");
    }
}

impl VideoStream for V4l2Stream {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_live(&self) -> bool {
        self.worker.is_some() && !self.slot.is_lost()
    }

    fn has_frame_data(&self) -> bool {
        self.worker.is_some() && self.slot.has_frame()
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.worker.is_none() {
            return Err(CaptureError::NotStreaming);
        }
        let (raw, sequence) = self.slot.read()?;
        let image = self.buf_to_rgb(&raw)?;
        Ok(Frame::new(image, sequence))
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop_requested.store(true, Ordering::Release);
        // The thread notices the flag within one dequeue timeout.
        if worker.join().is_err() {
            tracing::warn!(device = %self.device_path, "capture thread panicked");
        }
        tracing::debug!(device = %self.device_path, "camera stopped");
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.stop();
    }
}
