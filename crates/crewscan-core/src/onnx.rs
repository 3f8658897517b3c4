//! [`EmbeddingOracle`] backed by SCRFD + ArcFace.

use crate::detector::FaceDetector;
use crate::oracle::{EmbeddingOracle, OracleError};
use crate::recognizer::FaceRecognizer;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::Path;
use std::sync::Mutex;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// ONNX Runtime oracle. Sessions need `&mut`, so each sits behind a mutex and
/// concurrent workers take turns on the model.
pub struct OnnxOracle {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
    /// Minimum cosine similarity for a positive match.
    similarity_threshold: f32,
}

impl OnnxOracle {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path, similarity_threshold: f32) -> Result<Self, OracleError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            similarity_threshold,
        })
    }
}

impl EmbeddingOracle for OnnxOracle {
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, OracleError> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| OracleError::Other("detector lock poisoned".into()))?;
        Ok(detector.detect(image)?)
    }

    fn encode(&self, image: &RgbImage, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, OracleError> {
        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| OracleError::Other("recognizer lock poisoned".into()))?;
        boxes
            .iter()
            .map(|bbox| recognizer.extract(image, bbox).map_err(OracleError::from))
            .collect()
    }

    fn compare(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<bool> {
        candidates
            .iter()
            .map(|c| known.similarity(c) >= self.similarity_threshold)
            .collect()
    }

    fn distance(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<f32> {
        candidates.iter().map(|c| 1.0 - known.similarity(c)).collect()
    }
}
