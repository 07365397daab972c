//! Face comparison: does a captured face match the stored reference?

use crate::detector::{DetectOptions, DetectorError, FaceDetector};
use crate::geometry;
use crate::normalizer::{self, CropError};
use crate::types::{BoundingBox, ReferenceImage};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComparisonError {
    #[error("reference image could not be decoded: {0}")]
    ReferenceDecode(#[from] image::ImageError),
    #[error("reference image crop failed: {0}")]
    ReferenceCrop(#[from] CropError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("detector returned no landmarks; comparison needs five-point landmarks")]
    NoLandmarks,
    #[error("landmark geometry is degenerate")]
    DegenerateLandmarks,
}

/// Why a comparison succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostic {
    NoFaceDetected,
    MultipleFacesDetected,
    Mismatch,
    Match,
}

/// Outcome of one comparison. Consumed once by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub success: bool,
    /// Landmark-geometry similarity in [0, 1]; 0.0 when no single face pair was found.
    pub score: f32,
    /// Lower of the two detector confidences.
    pub confidence: f32,
    pub diagnostic: Diagnostic,
}

impl VerificationResult {
    fn rejected(diagnostic: Diagnostic) -> Self {
        Self {
            success: false,
            score: 0.0,
            confidence: 0.0,
            diagnostic,
        }
    }
}

/// Both must be met for a match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchThresholds {
    pub similarity: f32,
    pub confidence: f32,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            similarity: 0.90,
            confidence: 0.60,
        }
    }
}

/// Decide a match from the faces found in each image.
pub fn decide(
    reference: &[BoundingBox],
    candidate: &[BoundingBox],
    thresholds: &MatchThresholds,
) -> Result<VerificationResult, ComparisonError> {
    let (reference, candidate) = match (reference, candidate) {
        ([], _) | (_, []) => return Ok(VerificationResult::rejected(Diagnostic::NoFaceDetected)),
        ([r], [c]) => (r, c),
        _ => return Ok(VerificationResult::rejected(Diagnostic::MultipleFacesDetected)),
    };

    let (Some(ref_lms), Some(cand_lms)) = (&reference.landmarks, &candidate.landmarks) else {
        return Err(ComparisonError::NoLandmarks);
    };
    let score = geometry::landmark_similarity(ref_lms, cand_lms)
        .ok_or(ComparisonError::DegenerateLandmarks)?;
    let confidence = reference.confidence.min(candidate.confidence);

    let matched = score >= thresholds.similarity && confidence >= thresholds.confidence;
    Ok(VerificationResult {
        success: matched,
        score,
        confidence,
        diagnostic: if matched { Diagnostic::Match } else { Diagnostic::Mismatch },
    })
}

/// Runs detection on a reference and a candidate and compares the faces.
pub struct FaceComparator<D: ?Sized> {
    detector: Arc<D>,
    options: DetectOptions,
    thresholds: MatchThresholds,
    target_aspect: f32,
}

impl<D: ?Sized> Clone for FaceComparator<D> {
    fn clone(&self) -> Self {
        Self {
            detector: Arc::clone(&self.detector),
            options: self.options,
            thresholds: self.thresholds,
            target_aspect: self.target_aspect,
        }
    }
}

impl<D: FaceDetector + ?Sized> FaceComparator<D> {
    pub fn new(
        detector: Arc<D>,
        options: DetectOptions,
        thresholds: MatchThresholds,
        target_aspect: f32,
    ) -> Self {
        Self {
            detector,
            options,
            thresholds,
            target_aspect,
        }
    }

    /// Compare an already-normalized candidate against the reference.
    ///
    /// The reference is decoded and cropped to the same canonical aspect
    /// first, so both sides share geometry.
    pub async fn compare(
        &self,
        reference: &ReferenceImage,
        candidate: Arc<RgbImage>,
    ) -> Result<VerificationResult, ComparisonError> {
        let reference = Arc::new(normalizer::crop(&reference.decode()?, self.target_aspect)?);

        let reference_faces = self.detector.detect(reference, self.options).await?;
        let candidate_faces = self.detector.detect(candidate, self.options).await?;
        let keep = |faces: Vec<BoundingBox>| -> Vec<BoundingBox> {
            faces
                .into_iter()
                .filter(|f| f.confidence >= self.options.min_confidence)
                .collect()
        };
        let (reference_faces, candidate_faces) = (keep(reference_faces), keep(candidate_faces));

        let result = decide(&reference_faces, &candidate_faces, &self.thresholds)?;
        tracing::info!(
            reference_faces = reference_faces.len(),
            candidate_faces = candidate_faces.len(),
            similarity = result.score,
            confidence = result.confidence,
            diagnostic = ?result.diagnostic,
            "face comparison"
        );
        Ok(result)
    }
}
