//! Scene-based fake oracle for engine tests.
//!
//! Test images are small PNGs filled with one color whose red channel names
//! a scene, plus a white marker at (0, 0) that makes the image upright. The
//! oracle only finds faces in upright images, so the rotation sweep hits on
//! exactly one pass.

use crewscan_core::{BoundingBox, Embedding, EmbeddingOracle, OracleError};
use image::{Rgb, RgbImage};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

const MARKER: Rgb<u8> = Rgb([255, 255, 255]);
const WIDTH: u32 = 40;
const HEIGHT: u32 = 30;

pub const EMBED_A: [f32; 3] = [1.0, 0.0, 0.0];
pub const EMBED_B: [f32; 3] = [0.0, 1.0, 0.0];
pub const EMBED_C: [f32; 3] = [0.0, 0.0, 1.0];

pub fn write_scene(path: &Path, scene: u8) {
    let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([scene, 0, 0]));
    image.put_pixel(0, 0, MARKER);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image.save(path).unwrap();
}

fn scene_of(image: &RgbImage) -> u8 {
    image.get_pixel(image.width() / 2, image.height() / 2)[0]
}

pub struct SceneOracle {
    scenes: BTreeMap<u8, Vec<(BoundingBox, Embedding)>>,
    locate_calls: AtomicUsize,
}

impl SceneOracle {
    /// Scene 0 has no faces, 1 is A, 2 is B, 3 is C, 4 is A beside B and
    /// 5 is A beside an unknown face.
    pub fn standard() -> Self {
        let left = BoundingBox::new(2, 4, 12, 16);
        let right = BoundingBox::new(22, 4, 32, 16);
        let emb = |v: [f32; 3]| Embedding::new(v.to_vec());

        let mut scenes = BTreeMap::new();
        scenes.insert(0, Vec::new());
        scenes.insert(1, vec![(left, emb(EMBED_A))]);
        scenes.insert(2, vec![(left, emb(EMBED_B))]);
        scenes.insert(3, vec![(left, emb(EMBED_C))]);
        scenes.insert(4, vec![(left, emb(EMBED_A)), (right, emb(EMBED_B))]);
        scenes.insert(5, vec![(left, emb(EMBED_A)), (right, emb([-1.0, -1.0, -1.0]))]);
        Self {
            scenes,
            locate_calls: AtomicUsize::new(0),
        }
    }

    pub fn locate_calls(&self) -> usize {
        self.locate_calls.load(Ordering::SeqCst)
    }

    fn faces(&self, image: &RgbImage) -> &[(BoundingBox, Embedding)] {
        self.scenes
            .get(&scene_of(image))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl EmbeddingOracle for SceneOracle {
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, OracleError> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        if *image.get_pixel(0, 0) != MARKER {
            return Ok(Vec::new());
        }
        Ok(self.faces(image).iter().map(|(bbox, _)| *bbox).collect())
    }

    fn encode(&self, image: &RgbImage, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, OracleError> {
        Ok(boxes
            .iter()
            .filter_map(|bbox| {
                self.faces(image)
                    .iter()
                    .find(|(known, _)| known == bbox)
                    .map(|(_, embedding)| embedding.clone())
            })
            .collect())
    }

    fn compare(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<bool> {
        candidates
            .iter()
            .map(|c| known.euclidean_distance(c) <= 0.6)
            .collect()
    }

    fn distance(&self, known: &Embedding, candidates: &[Embedding]) -> Vec<f32> {
        candidates
            .iter()
            .map(|c| known.euclidean_distance(c))
            .collect()
    }
}
