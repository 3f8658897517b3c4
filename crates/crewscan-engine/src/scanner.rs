//! Scan orchestration.
//!
//! A scan lists the images under a root, opens the root's disk cache and
//! dispatches one unit per image. Units share nothing mutable: each gets
//! an immutable snapshot of the trained identities and of the raw tier, and
//! hands its result back through its own result-tier file. After every
//! unit has joined, the orchestrator re-reads those files into the
//! aggregate result, appends fresh detections to the raw tier and flushes
//! it once.

use crate::cache::{DiskCache, RawEntries, ResultCache};
use crate::config::Config;
use crate::dispatcher::{log_failure_summary, ErrorSink, Job, JobDispatcher, UnitFailure};
use crate::error::{CacheError, ScanError};
use crate::registry::{encode_portrait, Enrollment, IdentityRegistry};
use crewscan_core::{
    parse_identity_name, DetectedFace, EmbeddingOracle, Identity, IdentityName, ImageResult,
    MatchResolver, RotationSweep,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Aggregate scan output: image key to its result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanResult {
    images: BTreeMap<String, ImageResult>,
}

impl ScanResult {
    /// Add one image's result. An image already present keeps its result.
    pub fn insert(&mut self, result: ImageResult) {
        self.images.entry(result.image.clone()).or_insert(result);
    }

    /// Fold another result set into this one.
    pub fn merge(&mut self, other: ScanResult) {
        for (_, result) in other.images {
            self.insert(result);
        }
    }

    pub fn get(&self, image: &str) -> Option<&ImageResult> {
        self.images.get(image)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageResult> {
        self.images.values()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Split by the directory part of each image key. Images at the scan
    /// root are grouped under `""`.
    pub fn by_directory(&self) -> BTreeMap<String, ScanResult> {
        let mut groups: BTreeMap<String, ScanResult> = BTreeMap::new();
        for result in self.images.values() {
            let dir = result
                .image
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_default();
            groups.entry(dir).or_default().insert(result.clone());
        }
        groups
    }
}

impl FromIterator<ImageResult> for ScanResult {
    fn from_iter<I: IntoIterator<Item = ImageResult>>(iter: I) -> Self {
        let mut result = ScanResult::default();
        for image in iter {
            result.insert(image);
        }
        result
    }
}

#[derive(Debug)]
pub struct ScanReport {
    pub results: ScanResult,
    pub failures: Vec<UnitFailure>,
}

#[derive(Debug, Default)]
pub struct TrainReport {
    pub enrolled: Vec<String>,
    pub already_known: Vec<String>,
    pub failures: Vec<UnitFailure>,
}

/// What a scan unit hands back to the orchestrator.
struct ImageOutcome {
    key: String,
    /// Detections made by this unit, for the raw tier. `None` when the
    /// unit was served from cache.
    fresh_detections: Option<Vec<DetectedFace>>,
}

/// Read-only state shared by every unit of one scan.
struct UnitContext {
    oracle: Arc<dyn EmbeddingOracle>,
    identities: Arc<[Identity]>,
    raw: Arc<RawEntries>,
    results: ResultCache,
    merge_rotations: bool,
}

impl UnitContext {
    fn scan(&self, key: &str, path: &Path, sink: &ErrorSink) -> Result<ImageOutcome, ScanError> {
        if self.results.get(key).is_some() {
            tracing::debug!(image = key, "result cache hit");
            return Ok(ImageOutcome {
                key: key.to_string(),
                fresh_detections: None,
            });
        }

        let (faces, fresh) = match self.raw.get(key) {
            Some(faces) => {
                tracing::debug!(image = key, faces = faces.len(), "raw cache hit");
                (faces.clone(), false)
            }
            None => {
                let image = image::open(path)
                    .map_err(|source| ScanError::Image {
                        path: path.to_path_buf(),
                        source,
                    })?
                    .to_rgb8();
                let faces = RotationSweep::new(self.oracle.as_ref())
                    .merge_overlaps(self.merge_rotations)
                    .detect(&image)?;
                tracing::debug!(image = key, faces = faces.len(), "detected");
                (faces, true)
            }
        };

        if faces.is_empty() {
            sink.report(key, ScanError::NoFaceDetected(key.to_string()));
        } else {
            let result = MatchResolver::new(self.oracle.as_ref()).resolve(key, &self.identities, &faces);
            self.results.put(&result)?;
        }

        Ok(ImageOutcome {
            key: key.to_string(),
            fresh_detections: fresh.then_some(faces),
        })
    }
}

/// Training and scanning over one identity registry and one oracle.
pub struct Scanner {
    config: Config,
    oracle: Arc<dyn EmbeddingOracle>,
    registry: IdentityRegistry,
}

impl Scanner {
    pub fn new(config: Config, oracle: Arc<dyn EmbeddingOracle>, registry: IdentityRegistry) -> Self {
        Self {
            config,
            oracle,
            registry,
        }
    }

    /// Open the configured store and hydrate the registry from it.
    pub fn open(config: Config, oracle: Arc<dyn EmbeddingOracle>) -> Result<Self, ScanError> {
        let registry = IdentityRegistry::hydrate(config.open_store()?)?;
        Ok(Self::new(config, oracle, registry))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut IdentityRegistry {
        &mut self.registry
    }

    fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher::new(self.config.workers).with_timeout(self.config.unit_timeout())
    }

    /// Enroll every portrait in `dir`.
    ///
    /// Names are parsed and known keys skipped before dispatch, so only new
    /// identities cost an oracle call. Encoding runs in parallel; enrollment
    /// itself happens afterwards, one identity at a time.
    pub async fn train_dir(&mut self, dir: &Path) -> Result<TrainReport, ScanError> {
        let mut report = TrainReport::default();
        let mut queued = BTreeSet::new();
        let mut jobs = Vec::new();

        for path in self.list_images(dir)? {
            let label = file_label(&path);
            let name = match parse_identity_name(&path) {
                Ok(name) => name,
                Err(e) => {
                    report.failures.push(UnitFailure {
                        unit: label,
                        error: e.into(),
                    });
                    continue;
                }
            };

            let key = name.key();
            if self.registry.is_known(&key) || !queued.insert(key.clone()) {
                tracing::info!(
                    image = %label,
                    error = %ScanError::EnrollmentConflict(key.clone()),
                    "skipping portrait"
                );
                report.already_known.push(key);
                continue;
            }

            let oracle = Arc::clone(&self.oracle);
            jobs.push(Job::new(label, move |_: &ErrorSink| {
                let embedding = encode_portrait(&path, oracle.as_ref())?;
                Ok((name, embedding))
            }));
        }

        tracing::info!(dir = %dir.display(), portraits = jobs.len(), "training");
        let dispatched = self.dispatcher().run(jobs).await;
        report.failures.extend(dispatched.failures);

        let mut encoded: Vec<(IdentityName, _)> = dispatched.outputs;
        encoded.sort_by_key(|(name, _)| name.key());
        for (name, embedding) in encoded {
            let key = name.key();
            let mut identity = name.into_identity();
            identity.embedding = Some(embedding);
            match self.registry.enroll_from_record(identity) {
                Ok(Enrollment::Enrolled) => report.enrolled.push(key),
                Ok(Enrollment::AlreadyKnown) => report.already_known.push(key),
                Err(e) => report.failures.push(UnitFailure {
                    unit: key,
                    error: e.into(),
                }),
            }
        }

        tracing::info!(
            enrolled = report.enrolled.len(),
            already_known = report.already_known.len(),
            failures = report.failures.len(),
            "training finished"
        );
        log_failure_summary("training finished with failures", &report.failures);
        Ok(report)
    }

    /// Scan the images directly inside `dir`. Image keys are file names.
    pub async fn scan_dir(&self, dir: &Path) -> Result<ScanReport, ScanError> {
        let images = self
            .list_images(dir)?
            .into_iter()
            .map(|path| (file_label(&path), path))
            .collect();
        self.scan_images(dir, images).await
    }

    /// Scan every image below `root`. Image keys are `/`-separated paths
    /// relative to `root`; hidden directories and the cache are skipped.
    pub async fn scan_tree(&self, root: &Path) -> Result<ScanReport, ScanError> {
        let cache_dir = self.config.cache_dir_for(root);
        let shared_cache = self.config.cache_dir.as_deref();
        let mut images = Vec::new();

        let walker = walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let path = entry.path();
                entry.depth() == 0
                    || !(entry.file_type().is_dir()
                        && (is_hidden(path)
                            || path == cache_dir.as_path()
                            || shared_cache == Some(path)))
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::warn!(%error, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.config.is_image(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            images.push((relative_key(relative), entry.path().to_path_buf()));
        }

        self.scan_images(root, images).await
    }

    /// Scan `dir` alone or its whole tree, per the `recursive` setting.
    pub async fn scan(&self, dir: &Path) -> Result<ScanReport, ScanError> {
        if self.config.recursive {
            self.scan_tree(dir).await
        } else {
            self.scan_dir(dir).await
        }
    }

    async fn scan_images(
        &self,
        root: &Path,
        images: Vec<(String, PathBuf)>,
    ) -> Result<ScanReport, ScanError> {
        let cache_dir = self.config.cache_dir_for(root);
        let mut cache = DiskCache::open(&cache_dir)?;

        let context = Arc::new(UnitContext {
            oracle: Arc::clone(&self.oracle),
            identities: self.registry.trained_snapshot(),
            raw: cache.raw.snapshot(),
            results: cache.results.clone(),
            merge_rotations: self.config.merge_rotations,
        });

        tracing::info!(
            root = %root.display(),
            images = images.len(),
            identities = context.identities.len(),
            cached = cache.raw.len(),
            "scanning"
        );

        let jobs = images
            .into_iter()
            .map(|(key, path)| {
                let context = Arc::clone(&context);
                Job::new(key.clone(), move |sink: &ErrorSink| context.scan(&key, &path, sink))
            })
            .collect();
        let dispatched = self.dispatcher().run(jobs).await;
        let mut failures = dispatched.failures;

        let mut results = ScanResult::default();
        for outcome in dispatched.outputs {
            if let Some(faces) = outcome.fresh_detections {
                cache.put_raw(outcome.key.clone(), faces);
            }
            match cache.results.read(&outcome.key) {
                Ok(Some(result)) => results.insert(result),
                Ok(None) => {}
                Err(CacheError::Corrupt { path, message }) => failures.push(UnitFailure {
                    unit: outcome.key,
                    error: ScanError::CacheCorruption { path, message },
                }),
                Err(e) => failures.push(UnitFailure {
                    unit: outcome.key,
                    error: e.into(),
                }),
            }
        }

        cache.raw.flush()?;

        tracing::info!(
            root = %root.display(),
            matched_images = results.len(),
            failures = failures.len(),
            "scan finished"
        );
        log_failure_summary("scan finished with failures", &failures);
        Ok(ScanReport { results, failures })
    }

    fn list_images(&self, dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && self.config.is_image(p))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}
