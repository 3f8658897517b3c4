//! SCRFD face locator via ONNX Runtime.
//!
//! Letterboxes an RGB photo into the 640×640 model input, decodes the three
//! anchor-free stride heads and suppresses overlaps with NMS.

use crate::types::BoundingBox;
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface into the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied by the letterbox, for mapping boxes back.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// A decoded detection in original-image float coordinates.
#[derive(Debug, Clone, Copy)]
struct Scored {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

impl Scored {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Scored) -> f32 {
        let inter_w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let inter_h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }

    fn to_pixels(self, width: u32, height: u32) -> BoundingBox {
        let clamp_x = |v: f32| v.round().clamp(0.0, width as f32) as i32;
        let clamp_y = |v: f32| v.round().clamp(0.0, height as f32) as i32;
        BoundingBox::new(clamp_x(self.x1), clamp_y(self.y1), clamp_x(self.x2), clamp_y(self.y2))
    }
}

pub struct FaceDetector {
    session: Session,
    /// Output indices (score, bbox) per stride, resolved by name at load time.
    stride_indices: [(usize, usize); 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = output_indices(&output_names);
        tracing::info!(path = %model_path.display(), ?stride_indices, "loaded SCRFD model");

        Ok(Self { session, stride_indices })
    }

    /// Locate faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            detections.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .map(|d| d.to_pixels(width, height))
            .collect())
    }
}

/// Map output names like `score_8` / `bbox_8` to stride slots, falling back to
/// the standard positional layout `[scores 8/16/32, bboxes 8/16/32, kps ...]`.
fn output_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut indices = [(0, 3), (1, 4), (2, 5)];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => indices[slot] = (score, bbox),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    indices
}

/// Letterbox into a normalized NCHW tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let size = SCRFD_INPUT_SIZE as usize;
    let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

fn decode_stride(scores: &[f32], bboxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<Scored> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let grid_h = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let confidence = scores.get(idx).copied().unwrap_or(0.0);
        if confidence <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }

        let off = idx * 4;
        let Some(d) = bboxes.get(off..off + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let unbox_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
        let unbox_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

        detections.push(Scored {
            x1: unbox_x(anchor_x - d[0] * s),
            y1: unbox_y(anchor_y - d[1] * s),
            x2: unbox_x(anchor_x + d[2] * s),
            y2: unbox_y(anchor_y + d[3] * s),
            confidence,
        });
    }
    detections
}

fn nms(mut detections: Vec<Scored>, iou_threshold: f32) -> Vec<Scored> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Scored> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Scored {
        Scored { x1: x, y1: y, x2: x + w, y2: y + h, confidence }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                scored(5.0, 5.0, 100.0, 100.0, 0.8),
                scored(0.0, 0.0, 100.0, 100.0, 0.9),
                scored(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_output_indices_named_and_fallback() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_indices(&names), [(2, 0), (5, 3), (8, 6)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(output_indices(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_letterbox() {
        let image = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, letterbox) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert_eq!(letterbox.pad_x, 0.0);
        assert_eq!(letterbox.pad_y, 160.0);
        // Padding rows normalize to zero, content rows do not.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!(tensor[[0, 0, 320, 320]] > 0.9);
    }

    #[test]
    fn test_to_pixels_clamps_to_image() {
        let bbox = scored(-4.6, 10.4, 120.0, 30.0, 0.9).to_pixels(100, 50);
        assert_eq!(bbox, BoundingBox::new(0, 10, 100, 40));
    }
}
