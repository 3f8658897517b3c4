//! Enrolled identities, hydrated once from the store.

use crate::error::{ScanError, StoreError};
use crate::store::IdentityStore;
use crewscan_core::{parse_identity_name, EmbeddingOracle, Embedding, Identity, OracleError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Outcome of an enrollment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrollment {
    Enrolled,
    /// The key was already enrolled; nothing was written.
    AlreadyKnown,
}

/// Read-through cache over an [`IdentityStore`].
///
/// Loaded once at startup and never invalidated. New identities are written
/// to the store first and only become visible to lookups once the write
/// has succeeded.
pub struct IdentityRegistry {
    store: Box<dyn IdentityStore>,
    identities: BTreeMap<String, Identity>,
}

impl IdentityRegistry {
    pub fn hydrate(store: Box<dyn IdentityStore>) -> Result<Self, StoreError> {
        let identities: BTreeMap<String, Identity> = store
            .load_all()?
            .into_iter()
            .map(|identity| (identity.key.clone(), identity))
            .collect();

        tracing::info!(
            identities = identities.len(),
            trained = identities.values().filter(|i| i.is_trained()).count(),
            "identity registry hydrated"
        );
        Ok(Self { store, identities })
    }

    /// Enroll a fully built identity.
    ///
    /// A key that is already present is logged and skipped, not an error.
    pub fn enroll_from_record(&mut self, mut identity: Identity) -> Result<Enrollment, StoreError> {
        if self.identities.contains_key(&identity.key) {
            tracing::info!(
                error = %ScanError::EnrollmentConflict(identity.key.clone()),
                "skipping enrollment"
            );
            return Ok(Enrollment::AlreadyKnown);
        }

        if identity.enrolled_at.is_none() {
            identity.enrolled_at = Some(chrono::Utc::now().to_rfc3339());
        }

        match self.store.save(&identity) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(key)) => {
                // Persisted by someone else after hydration.
                tracing::info!(key = %key, "identity already stored; skipping enrollment");
                return Ok(Enrollment::AlreadyKnown);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            key = %identity.key,
            name = %identity.display_name(),
            trained = identity.is_trained(),
            "identity enrolled"
        );
        self.identities.insert(identity.key.clone(), identity);
        Ok(Enrollment::Enrolled)
    }

    /// Enroll the person named by a portrait file, encoding its face.
    ///
    /// Known keys are skipped before the oracle is called.
    pub fn enroll_from_image(
        &mut self,
        path: &Path,
        oracle: &dyn EmbeddingOracle,
    ) -> Result<Enrollment, ScanError> {
        let name = parse_identity_name(path)?;
        if self.is_known(&name.key()) {
            tracing::info!(
                error = %ScanError::EnrollmentConflict(name.key()),
                "skipping enrollment"
            );
            return Ok(Enrollment::AlreadyKnown);
        }

        let embedding = encode_portrait(path, oracle)?;
        let mut identity = name.into_identity();
        identity.embedding = Some(embedding);
        Ok(self.enroll_from_record(identity)?)
    }

    /// Every enrolled identity, in key order.
    pub fn lookup_all(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn get(&self, key: &str) -> Option<&Identity> {
        self.identities.get(key)
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.identities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Immutable copy of the trained identities, shared with scan workers.
    pub fn trained_snapshot(&self) -> Arc<[Identity]> {
        self.identities
            .values()
            .filter(|i| i.is_trained())
            .cloned()
            .collect()
    }
}

/// Embedding of the first face found in an upright portrait.
pub fn encode_portrait(path: &Path, oracle: &dyn EmbeddingOracle) -> Result<Embedding, ScanError> {
    let image = image::open(path)
        .map_err(|source| ScanError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let boxes = oracle.locate(&image)?;
    let Some(first) = boxes.first() else {
        return Err(ScanError::NoFaceDetected(path.display().to_string()));
    };

    let embeddings = oracle.encode(&image, std::slice::from_ref(first))?;
    let found = embeddings.len();
    embeddings.into_iter().next().ok_or_else(|| {
        OracleError::CountMismatch {
            boxes: 1,
            embeddings: found,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, SqliteStore};
    use crate::testing::{write_scene, SceneOracle, EMBED_A};

    fn identity(key: &str) -> Identity {
        let (names, country) = key.split_once('&').unwrap();
        let (first, last) = names.split_once('_').unwrap();
        Identity {
            key: key.into(),
            first_name: first.into(),
            middle_name: None,
            last_name: last.into(),
            country: country.into(),
            embedding: Some(Embedding::new(vec![1.0, 0.0, 0.0])),
            enrolled_at: None,
        }
    }

    #[test]
    fn test_enroll_then_conflict_is_skipped() {
        let mut registry =
            IdentityRegistry::hydrate(Box::new(SqliteStore::open_in_memory().unwrap())).unwrap();

        assert_eq!(
            registry.enroll_from_record(identity("ann_lee&usa")).unwrap(),
            Enrollment::Enrolled
        );
        assert_eq!(
            registry.enroll_from_record(identity("ann_lee&usa")).unwrap(),
            Enrollment::AlreadyKnown
        );
        assert!(registry.is_known("ann_lee&usa"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ann_lee&usa").unwrap().enrolled_at.is_some());
    }

    #[test]
    fn test_enrollment_persists_before_visible() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut registry =
                IdentityRegistry::hydrate(Box::new(FileStore::open(dir.path()).unwrap())).unwrap();
            registry.enroll_from_record(identity("ann_lee&usa")).unwrap();
        }

        let registry =
            IdentityRegistry::hydrate(Box::new(FileStore::open(dir.path()).unwrap())).unwrap();
        assert!(registry.is_known("ann_lee&usa"));
    }

    #[test]
    fn test_store_conflict_after_hydration_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut first =
            IdentityRegistry::hydrate(Box::new(FileStore::open(dir.path()).unwrap())).unwrap();
        let mut second =
            IdentityRegistry::hydrate(Box::new(FileStore::open(dir.path()).unwrap())).unwrap();

        first.enroll_from_record(identity("ann_lee&usa")).unwrap();
        assert_eq!(
            second.enroll_from_record(identity("ann_lee&usa")).unwrap(),
            Enrollment::AlreadyKnown
        );
        assert!(!second.is_known("ann_lee&usa"));
    }

    #[test]
    fn test_trained_snapshot_skips_untrained() {
        let mut registry =
            IdentityRegistry::hydrate(Box::new(SqliteStore::open_in_memory().unwrap())).unwrap();
        registry.enroll_from_record(identity("ann_lee&usa")).unwrap();
        let mut untrained = identity("bo_chen&china");
        untrained.embedding = None;
        registry.enroll_from_record(untrained).unwrap();

        let snapshot = registry.trained_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "ann_lee&usa");
        assert_eq!(registry.lookup_all().count(), 2);
    }

    #[test]
    fn test_enroll_from_image() {
        let dir = tempfile::tempdir().unwrap();
        let portrait = dir.path().join("ann_marie_lee&usa.png");
        write_scene(&portrait, 1);
        let oracle = SceneOracle::standard();

        let mut registry =
            IdentityRegistry::hydrate(Box::new(SqliteStore::open_in_memory().unwrap())).unwrap();
        assert_eq!(
            registry.enroll_from_image(&portrait, &oracle).unwrap(),
            Enrollment::Enrolled
        );
        let ann = registry.get("ann_lee&usa").unwrap();
        assert_eq!(ann.middle_name.as_deref(), Some("marie"));
        assert_eq!(ann.embedding.as_ref().unwrap().values, EMBED_A.to_vec());

        // Known keys never reach the oracle.
        let calls = oracle.locate_calls();
        assert_eq!(
            registry.enroll_from_image(&portrait, &oracle).unwrap(),
            Enrollment::AlreadyKnown
        );
        assert_eq!(oracle.locate_calls(), calls);
    }

    #[test]
    fn test_enroll_from_image_errors() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = SceneOracle::standard();
        let mut registry =
            IdentityRegistry::hydrate(Box::new(SqliteStore::open_in_memory().unwrap())).unwrap();

        let badly_named = dir.path().join("annlee.png");
        write_scene(&badly_named, 1);
        assert!(matches!(
            registry.enroll_from_image(&badly_named, &oracle),
            Err(ScanError::MalformedIdentityKey(_))
        ));

        let faceless = dir.path().join("bo_chen&china.png");
        write_scene(&faceless, 0);
        assert!(matches!(
            registry.enroll_from_image(&faceless, &oracle),
            Err(ScanError::NoFaceDetected(_))
        ));
        assert!(registry.is_empty());
    }
}
