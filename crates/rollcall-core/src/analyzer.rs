//! Recognition adapter: turns an image into located, embedded faces.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, FaceEmbedding, RecognitionResult};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Face detection + embedding capability.
///
/// Results come back in detection order (highest confidence first); each
/// result pairs a region with the embedding computed from that region.
pub trait FaceAnalyzer {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<RecognitionResult>, AnalyzerError>;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for &mut A {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<RecognitionResult>, AnalyzerError> {
        (**self).detect_and_encode(image)
    }
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir` (`det_10g.onnx`, `w600k_r50.onnx`).
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let scrfd = model_dir.join(crate::SCRFD_MODEL_FILE);
        let arcface = model_dir.join(crate::ARCFACE_MODEL_FILE);

        let detector = FaceDetector::load(&scrfd)?;
        tracing::info!(path = %scrfd.display(), "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(&arcface)?;
        tracing::info!(path = %arcface.display(), "ArcFace recognizer loaded");

        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<RecognitionResult>, AnalyzerError> {
        let faces = self.detector.detect(image)?;
        let recognizer = &mut self.recognizer;
        let results = encode_each(faces, |region| recognizer.extract(image, region));

        tracing::trace!(faces = results.len(), "analyzed image");
        Ok(results)
    }
}

/// Embed every detected face, dropping the ones that fail so the rest of the
/// image still counts.
fn encode_each<F>(faces: Vec<BoundingBox>, mut extract: F) -> Vec<RecognitionResult>
where
    F: FnMut(&BoundingBox) -> Result<FaceEmbedding, RecognizerError>,
{
    faces
        .into_iter()
        .filter_map(|region| match extract(&region) {
            Ok(embedding) => Some(RecognitionResult { region, embedding }),
            Err(RecognizerError::EmptyCrop(_)) => {
                tracing::debug!(?region, "face outside the image skipped");
                None
            }
            Err(e) => {
                tracing::warn!(?region, error = %e, "face could not be embedded; skipped");
                None
            }
        })
        .collect()
}
