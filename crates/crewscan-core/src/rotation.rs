//! Rotation-invariant detection sweep.
//!
//! The oracle only finds upright faces, so every image is offered to it at
//! 0°, 90°, 180° and 270° (clockwise) and the boxes found in each rotated
//! frame are mapped back into the original frame.

use crate::oracle::{EmbeddingOracle, OracleError};
use crate::types::{BoundingBox, DetectedFace};
use image::{imageops, RgbImage};

/// IoU above which two detections from different passes are treated as the
/// same physical face when overlap merging is enabled.
const ROTATION_MERGE_IOU: f32 = 0.5;

/// Map a point from a frame of size `(max_x, max_y)` that was rotated
/// `quarter_turns` times clockwise back into the unrotated frame.
///
/// Applying `k` and then `4 - k` (with the frame size swapped for odd `k`)
/// returns the original point exactly.
pub fn rotate_point(x: i32, y: i32, max_x: i32, max_y: i32, quarter_turns: u32) -> (i32, i32) {
    match quarter_turns % 4 {
        0 => (x, y),
        1 => (y, max_x - x),
        2 => (max_x - x, max_y - y),
        _ => (max_y - y, x),
    }
}

/// Map both corners of a box independently. Corner order is preserved, not
/// re-sorted.
pub fn rotate_box(bbox: &BoundingBox, max_x: i32, max_y: i32, quarter_turns: u32) -> BoundingBox {
    let (x1, y1) = rotate_point(bbox.x1, bbox.y1, max_x, max_y, quarter_turns);
    let (x2, y2) = rotate_point(bbox.x2, bbox.y2, max_x, max_y, quarter_turns);
    BoundingBox { x1, y1, x2, y2 }
}

/// Rotate an image clockwise by the given number of quarter turns.
pub fn rotate_image(image: &RgbImage, quarter_turns: u32) -> RgbImage {
    match quarter_turns % 4 {
        0 => image.clone(),
        1 => imageops::rotate90(image),
        2 => imageops::rotate180(image),
        _ => imageops::rotate270(image),
    }
}

/// Detection adapter that runs the oracle over all four rotations.
pub struct RotationSweep<'a> {
    oracle: &'a dyn EmbeddingOracle,
    merge_overlaps: bool,
}

impl<'a> RotationSweep<'a> {
    pub fn new(oracle: &'a dyn EmbeddingOracle) -> Self {
        Self {
            oracle,
            merge_overlaps: false,
        }
    }

    /// Drop detections from later passes that overlap an earlier one.
    ///
    /// Off by default: the plain sweep reports a face once per angle it was
    /// found at.
    pub fn merge_overlaps(mut self, enabled: bool) -> Self {
        self.merge_overlaps = enabled;
        self
    }

    /// Detect faces at every rotation and return them as one flat list in
    /// original-image coordinates. An empty list means no face was found at
    /// any angle.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, OracleError> {
        let mut faces: Vec<DetectedFace> = Vec::new();

        for quarter_turns in 0..4u32 {
            let rotated = rotate_image(image, quarter_turns);
            let boxes = self.oracle.locate(&rotated)?;
            if boxes.is_empty() {
                continue;
            }

            let embeddings = self.oracle.encode(&rotated, &boxes)?;
            if embeddings.len() != boxes.len() {
                return Err(OracleError::CountMismatch {
                    boxes: boxes.len(),
                    embeddings: embeddings.len(),
                });
            }

            let max_x = rotated.width() as i32;
            let max_y = rotated.height() as i32;
            tracing::trace!(quarter_turns, found = boxes.len(), "rotation pass");

            for (bbox, embedding) in boxes.iter().zip(embeddings) {
                let bbox = rotate_box(bbox, max_x, max_y, quarter_turns);
                if self.merge_overlaps
                    && faces.iter().any(|f| f.bbox.iou(&bbox) > ROTATION_MERGE_IOU)
                {
                    tracing::debug!(quarter_turns, ?bbox, "dropping duplicate rotated detection");
                    continue;
                }
                faces.push(DetectedFace {
                    index: faces.len(),
                    bbox,
                    embedding,
                });
            }
        }

        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{marked_image, ScriptedOracle};
    use crate::types::Embedding;
    use image::Rgb;

    #[test]
    fn test_rotate_point_roundtrip_all_turns() {
        let cases = [(106, 52, 640, 480), (0, 0, 1, 1), (-3, 7, 5, 9), (12, 400, 300, 200)];
        for &(x, y, max_x, max_y) in &cases {
            for k in 0..4u32 {
                let (rx, ry) = rotate_point(x, y, max_x, max_y, k);
                // Odd turns swap the frame dimensions.
                let (back_x, back_y) = if k % 2 == 1 { (max_y, max_x) } else { (max_x, max_y) };
                let restored = rotate_point(rx, ry, back_x, back_y, (4 - k) % 4);
                assert_eq!(restored, (x, y), "k={k} point=({x},{y}) frame=({max_x},{max_y})");
            }
        }
    }

    #[test]
    fn test_rotate_point_table() {
        assert_eq!(rotate_point(3, 5, 10, 20, 0), (3, 5));
        assert_eq!(rotate_point(3, 5, 10, 20, 1), (5, 7));
        assert_eq!(rotate_point(3, 5, 10, 20, 2), (7, 15));
        assert_eq!(rotate_point(3, 5, 10, 20, 3), (15, 3));
        assert_eq!(rotate_point(3, 5, 10, 20, 4), (3, 5));
    }

    #[test]
    fn test_rotate_box_roundtrip() {
        let bbox = BoundingBox::new(10, 20, 50, 90);
        for k in 0..4u32 {
            let rotated = rotate_box(&bbox, 300, 200, k);
            let (bx, by) = if k % 2 == 1 { (200, 300) } else { (300, 200) };
            assert_eq!(rotate_box(&rotated, bx, by, (4 - k) % 4), bbox);
        }
    }

    #[test]
    fn test_rotate_image_dimensions() {
        let image = marked_image(40, 30, [0, 0]);
        assert_eq!(rotate_image(&image, 1).dimensions(), (30, 40));
        assert_eq!(rotate_image(&image, 2).dimensions(), (40, 30));
        assert_eq!(rotate_image(&image, 3).dimensions(), (30, 40));
    }

    #[test]
    fn test_pixel_mapping_agrees_with_image_rotation() {
        // A marked pixel in each rotated image maps back to where it started.
        let (w, h) = (40u32, 30u32);
        let mut image = RgbImage::from_pixel(w, h, Rgb([0, 0, 0]));
        image.put_pixel(7, 4, Rgb([255, 0, 0]));

        for k in 0..4u32 {
            let rotated = rotate_image(&image, k);
            let (px, py) = rotated
                .enumerate_pixels()
                .find(|(_, _, p)| p.0 == [255, 0, 0])
                .map(|(x, y, _)| (x as i32, y as i32))
                .unwrap();
            // Pixel indices are cell corners; map the far corner and take
            // the minimum so whole cells line up.
            let a = rotate_point(px, py, rotated.width() as i32, rotated.height() as i32, k);
            let b = rotate_point(px + 1, py + 1, rotated.width() as i32, rotated.height() as i32, k);
            assert_eq!((a.0.min(b.0), a.1.min(b.1)), (7, 4), "k={k}");
        }
    }

    #[test]
    fn test_sweep_upright_face_found_once() {
        let oracle = ScriptedOracle::upright(vec![(
            BoundingBox::new(2, 3, 10, 12),
            Embedding::new(vec![1.0, 0.0]),
        )]);
        let image = marked_image(40, 30, [0, 0]);

        let faces = RotationSweep::new(&oracle).detect(&image).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].index, 0);
        assert_eq!(faces[0].bbox, BoundingBox::new(2, 3, 10, 12));
        assert_eq!(oracle.locate_calls(), 4);
    }

    #[test]
    fn test_sweep_sideways_face_mapped_back() {
        let oracle = ScriptedOracle::upright(vec![(
            BoundingBox::new(2, 3, 10, 12),
            Embedding::new(vec![1.0, 0.0]),
        )]);
        // After one clockwise turn the bottom-left pixel becomes top-left.
        let (w, h) = (40, 30);
        let image = marked_image(w, h, [0, h - 1]);

        let faces = RotationSweep::new(&oracle).detect(&image).unwrap();
        assert_eq!(faces.len(), 1);
        // Rotated frame is (h, w); k=1 maps (x, y) -> (y, h - x).
        let h = h as i32;
        assert_eq!(faces[0].bbox, BoundingBox::new(3, h - 2, 12, h - 10));
    }

    #[test]
    fn test_sweep_concatenates_every_rotation() {
        let oracle = ScriptedOracle::every_rotation(vec![(
            BoundingBox::new(2, 3, 10, 12),
            Embedding::new(vec![1.0, 0.0]),
        )]);
        let image = marked_image(40, 30, [0, 0]);

        let faces = RotationSweep::new(&oracle).detect(&image).unwrap();
        assert_eq!(faces.len(), 4);
        assert_eq!(faces.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(faces[1].bbox, BoundingBox::new(3, 28, 12, 20));
    }

    #[test]
    fn test_sweep_merge_overlaps_collapses_duplicates() {
        // A centered box on a square image lands on itself at every angle.
        let oracle = ScriptedOracle::every_rotation(vec![(
            BoundingBox::new(10, 10, 30, 30),
            Embedding::new(vec![1.0, 0.0]),
        )]);
        let image = marked_image(40, 40, [0, 0]);

        let plain = RotationSweep::new(&oracle).detect(&image).unwrap();
        assert_eq!(plain.len(), 4);

        let merged = RotationSweep::new(&oracle)
            .merge_overlaps(true)
            .detect(&image)
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].index, 0);
    }

    #[test]
    fn test_sweep_no_faces_is_empty_not_error() {
        let oracle = ScriptedOracle::upright(Vec::new());
        let image = marked_image(20, 20, [0, 0]);
        let faces = RotationSweep::new(&oracle).detect(&image).unwrap();
        assert!(faces.is_empty());
        assert_eq!(oracle.locate_calls(), 4);
    }
}
