//! Seam to the face-embedding model.
//!
//! The scan pipeline never looks inside the model. It only needs boxes,
//! embeddings for those boxes, a match decision and a ranking distance.

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("oracle returned {embeddings} embeddings for {boxes} boxes")]
    CountMismatch { boxes: usize, embeddings: usize },
    #[error("{0}")]
    Other(String),
}

/// Face locator, encoder and comparator.
///
/// `compare` is authoritative for whether a face matches; `distance` is only
/// used to rank competing matches. Implementations must not assume the two
/// agree at the decision boundary.
pub trait EmbeddingOracle: Send + Sync {
    /// Locate faces in an upright image.
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, OracleError>;

    /// Encode one embedding per box, in box order.
    fn encode(&self, image: &RgbImage, boxes: &[BoundingBox])
        -> Result<Vec<Embedding>, OracleError>;

    /// Match decision of `known` against each candidate.
    fn compare(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<bool>;

    /// Distance of `known` to each candidate. Lower = more similar.
    fn distance(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<f32>;
}
