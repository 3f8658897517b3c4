use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Axis-aligned face box in integer pixel coordinates.
///
/// Corners are kept exactly as produced by the rotation mapping, so after a
/// quarter-turn `x1` may be greater than `x2`. Geometry helpers below are
/// orientation-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 as f32 - self.x1 as f32).abs()
    }

    pub fn height(&self) -> f32 {
        (self.y2 as f32 - self.y1 as f32).abs()
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x1 as f32 + self.x2 as f32) / 2.0,
            (self.y1 as f32 + self.y2 as f32) / 2.0,
        )
    }

    /// Same box with corners ordered so that `x1 <= x2` and `y1 <= y2`.
    pub fn normalized(&self) -> Self {
        Self {
            x1: self.x1.min(self.x2),
            y1: self.y1.min(self.y2),
            x2: self.x1.max(self.x2),
            y2: self.y1.max(self.y2),
        }
    }

    /// Intersection-over-Union between two boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let a = self.normalized();
        let b = other.normalized();

        let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0) as f32;
        let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0) as f32;
        let inter_area = inter_w * inter_h;
        let union_area = a.area() + b.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Face embedding vector as produced by the embedding oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian `f32` bytes, for blob storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Trailing bytes that do
    /// not form a whole `f32` are ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self { values }
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable key, `first_last&country`.
    pub key: String,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: String,
    pub country: String,
    /// Absent until the identity has been trained on a portrait.
    #[serde(default)]
    pub embedding: Option<Embedding>,
    /// RFC 3339 timestamp of enrollment.
    #[serde(default)]
    pub enrolled_at: Option<String>,
}

impl Identity {
    pub fn display_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{} {} {}", self.first_name, middle, self.last_name),
            None => format!("{} {}", self.first_name, self.last_name),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.embedding.is_some()
    }
}

/// One face found in a scanned image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    /// Position in the image's flat detection list.
    pub index: usize,
    /// Box in original-image coordinates.
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Square matrix of scale-normalized distances between face centers.
pub type LayoutMatrix = Vec<Vec<f32>>;

/// A single identity's claim on a detected face, before deduplication.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub identity: String,
    pub face_index: usize,
    /// Embedding distance from the oracle. Lower = more similar.
    pub distance: f32,
    /// Inter-face layout of the whole image, shared by every candidate of it.
    pub layout: Arc<LayoutMatrix>,
}

/// Final per-image attribution of detected faces to identities.
///
/// A face index appears under at most one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    pub image: String,
    pub matches: BTreeMap<String, BTreeSet<usize>>,
    #[serde(default)]
    pub layout: LayoutMatrix,
}

impl ImageResult {
    pub fn empty(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Identity keys present in this image.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.matches.keys().map(String::as_str)
    }

    /// Identity that owns the given face index, if any.
    pub fn owner_of(&self, face_index: usize) -> Option<&str> {
        self.matches
            .iter()
            .find(|(_, faces)| faces.contains(&face_index))
            .map(|(key, _)| key.as_str())
    }

    /// True when no face index is claimed by two identities.
    pub fn is_exclusive(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.matches
            .values()
            .flat_map(|faces| faces.iter())
            .all(|index| seen.insert(*index))
    }
}
