//! Scripted oracle for unit tests.

use crate::oracle::{EmbeddingOracle, OracleError};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const MARKER: Rgb<u8> = Rgb([255, 255, 255]);
const BACKGROUND: Rgb<u8> = Rgb([60, 60, 60]);

/// Gray image with a white marker pixel. The scripted oracle treats an
/// image as upright when the marker sits at (0, 0).
pub fn marked_image(width: u32, height: u32, marker: [u32; 2]) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    image.put_pixel(marker[0], marker[1], MARKER);
    image
}

pub struct ScriptedOracle {
    faces: Vec<(BoundingBox, Embedding)>,
    upright_only: bool,
    tolerance: f32,
    locate_calls: AtomicUsize,
}

impl ScriptedOracle {
    /// Finds `faces` only when the image is upright.
    pub fn upright(faces: Vec<(BoundingBox, Embedding)>) -> Self {
        Self {
            faces,
            upright_only: true,
            tolerance: 0.6,
            locate_calls: AtomicUsize::new(0),
        }
    }

    /// Finds `faces` at every rotation.
    pub fn every_rotation(faces: Vec<(BoundingBox, Embedding)>) -> Self {
        Self {
            upright_only: false,
            ..Self::upright(faces)
        }
    }

    pub fn locate_calls(&self) -> usize {
        self.locate_calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingOracle for ScriptedOracle {
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, OracleError> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        if self.upright_only && *image.get_pixel(0, 0) != MARKER {
            return Ok(Vec::new());
        }
        Ok(self.faces.iter().map(|(bbox, _)| *bbox).collect())
    }

    fn encode(
        &self,
        _image: &RgbImage,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, OracleError> {
        Ok(self
            .faces
            .iter()
            .take(boxes.len())
            .map(|(_, embedding)| embedding.clone())
            .collect())
    }

    fn compare(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<bool> {
        candidates
            .iter()
            .map(|c| known.euclidean_distance(c) <= self.tolerance)
            .collect()
    }

    fn distance(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<f32> {
        candidates
            .iter()
            .map(|c| known.euclidean_distance(c))
            .collect()
    }
}
