//! Attribution of detected faces to enrolled identities.
//!
//! Every trained identity is compared against every detected face. A face
//! claimed by more than one identity goes to the claim with the smallest
//! distance; exact ties go to the lexicographically smaller identity key so
//! the outcome does not depend on registry order.

use crate::oracle::EmbeddingOracle;
use crate::spatial;
use crate::types::{BoundingBox, DetectedFace, Embedding, Identity, ImageResult, MatchCandidate};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct MatchResolver<'a> {
    oracle: &'a dyn EmbeddingOracle,
}

impl<'a> MatchResolver<'a> {
    pub fn new(oracle: &'a dyn EmbeddingOracle) -> Self {
        Self { oracle }
    }

    /// Compare, deduplicate and build the exclusive result for one image.
    pub fn resolve(&self, image: &str, identities: &[Identity], faces: &[DetectedFace]) -> ImageResult {
        let candidates = self.candidates(identities, faces);
        let layout = candidates
            .first()
            .map(|c| c.layout.as_ref().clone())
            .unwrap_or_else(|| layout_of(faces));

        let matches = deduplicate(&candidates);
        tracing::debug!(
            image,
            faces = faces.len(),
            candidates = candidates.len(),
            identities = matches.len(),
            "resolved image"
        );

        ImageResult {
            image: image.to_string(),
            matches,
            layout,
        }
    }

    /// Every (identity, face) pair the oracle decides is a match.
    ///
    /// Identities without an embedding are skipped. The decision comes from
    /// `compare`; `distance` is recorded for ranking only.
    pub fn candidates(&self, identities: &[Identity], faces: &[DetectedFace]) -> Vec<MatchCandidate> {
        if faces.is_empty() {
            return Vec::new();
        }

        let layout = Arc::new(layout_of(faces));
        let embeddings: Vec<Embedding> = faces.iter().map(|f| f.embedding.clone()).collect();
        let mut candidates = Vec::new();

        for identity in identities {
            let Some(known) = identity.embedding.as_ref() else {
                continue;
            };

            let decisions = self.oracle.compare(known, &embeddings);
            let distances = self.oracle.distance(known, &embeddings);

            for (pos, (face, matched)) in faces.iter().zip(decisions).enumerate() {
                if !matched {
                    continue;
                }
                let distance = distances.get(pos).copied().unwrap_or(f32::INFINITY);
                candidates.push(MatchCandidate {
                    identity: identity.key.clone(),
                    face_index: face.index,
                    distance,
                    layout: Arc::clone(&layout),
                });
            }
        }

        candidates
    }
}

fn layout_of(faces: &[DetectedFace]) -> Vec<Vec<f32>> {
    let boxes: Vec<BoundingBox> = faces.iter().map(|f| f.bbox).collect();
    spatial::pairwise_distance(&boxes)
}

/// Keep, for every face index, only the closest claim.
pub fn deduplicate(candidates: &[MatchCandidate]) -> BTreeMap<String, BTreeSet<usize>> {
    let mut winners: BTreeMap<usize, &MatchCandidate> = BTreeMap::new();

    for candidate in candidates {
        winners
            .entry(candidate.face_index)
            .and_modify(|best| {
                if closer(candidate, best) {
                    *best = candidate;
                }
            })
            .or_insert(candidate);
    }

    let mut matches: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
    for (face_index, winner) in winners {
        matches
            .entry(winner.identity.clone())
            .or_default()
            .insert(face_index);
    }
    matches
}

fn closer(a: &MatchCandidate, b: &MatchCandidate) -> bool {
    match a.distance.total_cmp(&b.distance) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a.identity < b.identity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOracle;

    fn identity(key: &str, values: Vec<f32>) -> Identity {
        Identity {
            key: key.to_string(),
            first_name: key.to_string(),
            middle_name: None,
            last_name: "x".into(),
            country: "usa".into(),
            embedding: Some(Embedding::new(values)),
            enrolled_at: None,
        }
    }

    fn face(index: usize, x: i32, values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            index,
            bbox: BoundingBox::new(x, 0, x + 10, 10),
            embedding: Embedding::new(values),
        }
    }

    fn candidate(identity: &str, face_index: usize, distance: f32) -> MatchCandidate {
        MatchCandidate {
            identity: identity.into(),
            face_index,
            distance,
            layout: Arc::new(Vec::new()),
        }
    }

    #[test]
    fn test_dedup_keeps_smallest_distance() {
        let candidates = vec![
            candidate("far", 2, 0.7),
            candidate("near", 2, 0.3),
            candidate("far", 1, 0.4),
        ];
        let matches = deduplicate(&candidates);
        assert_eq!(matches["near"], BTreeSet::from([2]));
        assert_eq!(matches["far"], BTreeSet::from([1]));
    }

    #[test]
    fn test_dedup_drops_identity_left_without_faces() {
        let candidates = vec![candidate("b", 0, 0.5), candidate("a", 0, 0.1)];
        let matches = deduplicate(&candidates);
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key("a"));
    }

    #[test]
    fn test_dedup_exact_tie_is_order_independent() {
        let forward = deduplicate(&[candidate("zed", 0, 0.4), candidate("amy", 0, 0.4)]);
        let backward = deduplicate(&[candidate("amy", 0, 0.4), candidate("zed", 0, 0.4)]);
        assert_eq!(forward, backward);
        assert!(forward.contains_key("amy"));
    }

    #[test]
    fn test_resolve_is_exclusive() {
        let oracle = ScriptedOracle::upright(Vec::new());
        let identities = vec![
            identity("ann", vec![0.0, 0.0]),
            identity("bob", vec![0.5, 0.0]),
        ];
        // Both identities are within tolerance of faces 0 and 1.
        let faces = vec![face(0, 0, vec![0.1, 0.0]), face(1, 20, vec![0.4, 0.0])];

        let result = MatchResolver::new(&oracle).resolve("a.jpg", &identities, &faces);
        assert!(result.is_exclusive());
        assert_eq!(result.owner_of(0), Some("ann"));
        assert_eq!(result.owner_of(1), Some("bob"));
        assert_eq!(result.layout.len(), 2);
    }

    #[test]
    fn test_resolve_nothing_matches_gives_empty_mapping() {
        let oracle = ScriptedOracle::upright(Vec::new());
        let identities = vec![identity("ann", vec![10.0, 10.0])];
        let faces = vec![face(0, 0, vec![0.0, 0.0])];

        let result = MatchResolver::new(&oracle).resolve("a.jpg", &identities, &faces);
        assert_eq!(result.image, "a.jpg");
        assert!(result.is_empty());
        assert_eq!(result.layout, vec![vec![0.0]]);
    }

    #[test]
    fn test_resolve_skips_untrained_identities() {
        let oracle = ScriptedOracle::upright(Vec::new());
        let mut untrained = identity("ghost", vec![0.0, 0.0]);
        untrained.embedding = None;
        let faces = vec![face(0, 0, vec![0.0, 0.0])];

        let result = MatchResolver::new(&oracle).resolve("a.jpg", &[untrained], &faces);
        assert!(result.is_empty());
    }

    #[test]
    fn test_candidates_share_one_layout() {
        let oracle = ScriptedOracle::upright(Vec::new());
        let identities = vec![identity("ann", vec![0.0, 0.0]), identity("bob", vec![0.1, 0.0])];
        let faces = vec![face(0, 0, vec![0.0, 0.0]), face(1, 30, vec![0.05, 0.0])];

        let candidates = MatchResolver::new(&oracle).candidates(&identities, &faces);
        assert_eq!(candidates.len(), 4);
        assert!(candidates
            .windows(2)
            .all(|w| Arc::ptr_eq(&w[0].layout, &w[1].layout)));
    }

    #[test]
    fn test_duplicate_rotated_detections_split_between_identities() {
        // One physical face seen at two angles yields two near-identical
        // detections. Each detection is resolved on its own, so two
        // identities within tolerance can each keep one of them.
        let oracle = ScriptedOracle::upright(Vec::new());
        let identities = vec![identity("ann", vec![0.0, 0.0]), identity("bob", vec![0.3, 0.0])];
        let faces = vec![face(0, 0, vec![0.05, 0.0]), face(1, 0, vec![0.25, 0.0])];

        let result = MatchResolver::new(&oracle).resolve("a.jpg", &identities, &faces);
        assert!(result.is_exclusive());
        assert_eq!(result.owner_of(0), Some("ann"));
        assert_eq!(result.owner_of(1), Some("bob"));
    }
}
