//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from face crops using the
//! w600k_r50 ArcFace model.

use crate::matcher::DEFAULT_TOLERANCE;
use crate::types::{BoundingBox, FaceEmbedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
/// Fraction of the box size added on every side before cropping.
const CROP_MARGIN: f32 = 0.1;
/// Cosine similarity at which two ArcFace embeddings count as the same
/// person (unaligned crops from downsampled webcam frames).
const ARCFACE_MATCH_COSINE: f32 = 0.3;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region {0:?} lies outside the image")]
    EmptyCrop(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract the embedding for `face` within `image`, normalized and scaled
    /// to `embedding_scale()`.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceEmbedding, RecognizerError> {
        let crop = crop_face(image, face).ok_or_else(|| RecognizerError::EmptyCrop(face.clone()))?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(FaceEmbedding {
            values: to_matching_space(raw_data),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Crop the face (plus margin) clamped to the image and resize it to the
/// model input size. `None` if nothing of the box lies inside the image.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;

    let x0 = (face.x - mx).max(0.0);
    let y0 = (face.y - my).max(0.0);
    let x1 = (face.x + face.width + mx).min(image.width() as f32);
    let y1 = (face.y + face.height + my).min(image.height() as f32);

    let (w, h) = ((x1 - x0).floor() as u32, (y1 - y0).floor() as u32);
    if x1 <= x0 || y1 <= y0 || w == 0 || h == 0 {
        return None;
    }

    let crop = imageops::crop_imm(image, x0 as u32, y0 as u32, w, h).to_image();
    Some(imageops::resize(&crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle))
}

/// Normalize a 112×112 RGB crop into a NCHW float tensor.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}

/// Length every embedding is scaled to.
///
/// For two vectors of length `r` the Euclidean distance is
/// `r * sqrt(2 - 2cos)`, so this length places [`ARCFACE_MATCH_COSINE`]
/// exactly at [`DEFAULT_TOLERANCE`].
fn embedding_scale() -> f32 {
    DEFAULT_TOLERANCE / (2.0 - 2.0 * ARCFACE_MATCH_COSINE).sqrt()
}

/// L2-normalize, then scale to [`embedding_scale`].
fn to_matching_space(raw: &[f32]) -> Vec<f32> {
    let scale = embedding_scale();
    l2_normalize(raw).into_iter().map(|x| x * scale).collect()
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let crop = RgbImage::from_pixel(112, 112, image::Rgb([128, 0, 255]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 5, 5]] - (128.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_face_resizes_to_input() {
        let img = RgbImage::new(320, 240);
        let crop = crop_face(&img, &face(100.0, 50.0, 60.0, 80.0)).unwrap();
        assert_eq!(crop.dimensions(), (112, 112));
    }

    #[test]
    fn test_crop_face_clamps_to_image() {
        let img = RgbImage::new(100, 100);
        assert!(crop_face(&img, &face(-20.0, -20.0, 50.0, 50.0)).is_some());
        assert!(crop_face(&img, &face(150.0, 150.0, 20.0, 20.0)).is_none());
    }

    fn cosine_pair(cos: f32) -> (FaceEmbedding, FaceEmbedding) {
        let a = FaceEmbedding::new(to_matching_space(&[1.0, 0.0, 0.0]));
        let b = FaceEmbedding::new(to_matching_space(&[cos, (1.0 - cos * cos).sqrt(), 0.0]));
        (a, b)
    }

    #[test]
    fn test_match_cosine_maps_onto_default_tolerance() {
        let (a, b) = cosine_pair(ARCFACE_MATCH_COSINE);
        assert!((a.distance(&b) - DEFAULT_TOLERANCE).abs() < 1e-5);

        let (a, same) = cosine_pair(0.5);
        assert!(a.distance(&same) < DEFAULT_TOLERANCE);
        let (a, other) = cosine_pair(0.1);
        assert!(a.distance(&other) > DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_matching_space_length() {
        let v = to_matching_space(&[3.0, 4.0]);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - embedding_scale()).abs() < 1e-6);
        assert!((v[0] / v[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
