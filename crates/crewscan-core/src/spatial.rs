//! Scale-normalized layout of the faces in one image.

use crate::types::{BoundingBox, LayoutMatrix};

/// Euclidean distances between every pair of box centers.
pub fn center_distances(boxes: &[BoundingBox]) -> LayoutMatrix {
    let centers: Vec<(f32, f32)> = boxes.iter().map(BoundingBox::center).collect();
    centers
        .iter()
        .map(|&(x1, y1)| {
            centers
                .iter()
                .map(|&(x2, y2)| ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt())
                .collect()
        })
        .collect()
}

/// Center-to-center distance divided by the mean face area of the image.
///
/// Farther faces are smaller, so dividing by area keeps the matrix
/// comparable across shots taken at different distances. Division happens
/// after the distance, diagonal included. When every box is degenerate (mean
/// area 0) the raw distances are returned.
pub fn pairwise_distance(boxes: &[BoundingBox]) -> LayoutMatrix {
    if boxes.is_empty() {
        return Vec::new();
    }

    let mean_area = boxes.iter().map(BoundingBox::area).sum::<f32>() / boxes.len() as f32;
    let distances = center_distances(boxes);
    if mean_area <= 0.0 {
        tracing::debug!(faces = boxes.len(), "degenerate face boxes; layout left unscaled");
        return distances;
    }

    distances
        .into_iter()
        .map(|row| row.into_iter().map(|d| d / mean_area).collect())
        .collect()
}
