//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes RGB frames into the 640×640 model input, decodes the three
//! anchor-free stride heads (boxes + five landmarks) and applies NMS.
//! Inference runs on the blocking pool so the caller's task never stalls.

use crate::detector::{DetectFuture, DetectOptions, DetectorError, FaceDetector};
use crate::types::{BoundingBox, Landmarks};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Output tensor indices for one stride: (score, bbox, kps).
type HeadIndices = (usize, usize, usize);

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    scaled_width: u32,
    scaled_height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: (INPUT_SIZE - scaled_width) / 2,
            pad_y: (INPUT_SIZE - scaled_height) / 2,
            scaled_width,
            scaled_height,
        }
    }

    /// Map a point in model-input space back to the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Loaded SCRFD session plus its output layout.
struct ScrfdModel {
    session: Session,
    heads: [HeadIndices; 3],
}

impl ScrfdModel {
    fn run(&mut self, frame: &RgbImage, min_confidence: f32) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::InferenceFailed(format!(
                "empty frame {width}x{height}"
            )));
        }

        let letterbox = Letterbox::fit(width, height);
        let input = preprocess(frame, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.heads[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideHead {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(head.decode(&letterbox, min_confidence));
        }

        let mut faces = nms(candidates, NMS_THRESHOLD);
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        tracing::trace!(faces = faces.len(), width, height, "SCRFD detection");
        Ok(faces)
    }
}

/// SCRFD-backed [`FaceDetector`]. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct ScrfdDetector {
    model: Arc<Mutex<ScrfdModel>>,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = head_indices(&output_names);
        tracing::debug!(?heads, "SCRFD output tensor mapping");

        Ok(Self {
            model: Arc::new(Mutex::new(ScrfdModel { session, heads })),
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, image: Arc<RgbImage>, options: DetectOptions) -> DetectFuture {
        let model = Arc::clone(&self.model);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut model = model
                    .lock()
                    .map_err(|_| DetectorError::Unavailable("detector session poisoned".into()))?;
                model.run(&image, options.min_confidence)
            })
            .await
            .map_err(|e| DetectorError::Unavailable(format!("detector task failed: {e}")))?
        })
    }
}

/// Letterbox an RGB frame into a normalized NCHW tensor.
///
/// Padding is filled with the mean so it normalizes to 0.0.
fn preprocess(frame: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let resized = imageops::resize(
        frame,
        letterbox.scaled_width,
        letterbox.scaled_height,
        FilterType::Triangle,
    );

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    tensor
}

/// Map output tensors to stride heads.
///
/// Exports either name their outputs "score_8", "bbox_16", "kps_32", ... or
/// use generic numeric names, in which case the standard positional order
/// applies: [0-2] scores, [3-5] bboxes, [6-8] kps.
fn head_indices(names: &[String]) -> [HeadIndices; 3] {
    let find = |prefix: &str, stride: u32| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<HeadIndices>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw output slices for one stride level.
struct StrideHead<'a> {
    stride: u32,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, letterbox: &Letterbox, min_confidence: f32) -> Vec<BoundingBox> {
        let grid = (INPUT_SIZE / self.stride) as usize;
        let stride = self.stride as f32;
        let anchors = grid * grid * ANCHORS_PER_CELL;

        let mut faces = Vec::new();
        for idx in 0..anchors {
            let score = self.scores.get(idx).copied().unwrap_or(0.0);
            if score < min_confidence {
                continue;
            }
            let Some(dist) = self.bboxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * stride;
            let ay = (cell / grid) as f32 * stride;

            let (x1, y1) = letterbox.unmap(ax - dist[0] * stride, ay - dist[1] * stride);
            let (x2, y2) = letterbox.unmap(ax + dist[2] * stride, ay + dist[3] * stride);

            let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                let mut lms: Landmarks = [(0.0, 0.0); 5];
                for (i, lm) in lms.iter_mut().enumerate() {
                    *lm = letterbox.unmap(ax + k[i * 2] * stride, ay + k[i * 2 + 1] * stride);
                }
                lms
            });

            faces.push(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            });
        }
        faces
    }
}

/// Non-Maximum Suppression: keep the most confident of overlapping boxes.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
