//! Two-tier disk cache.
//!
//! The raw tier is a single consolidated file mapping image keys to their
//! detections; it is read once when a scan starts, only grows in memory while
//! workers run, and is written back once after they join. The result tier is
//! one file per image holding its resolved [`ImageResult`]; workers write
//! these directly since each image owns a distinct file.
//!
//! Unreadable or corrupt cache files are treated as misses.

use crate::error::CacheError;
use crewscan_core::{DetectedFace, ImageResult};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RAW_CACHE_FILE: &str = "raw_detections.json";
pub const RESULT_CACHE_DIR: &str = "results";

/// Raw detections by image key.
pub type RawEntries = BTreeMap<String, Vec<DetectedFace>>;

/// Write `bytes` to a temporary sibling and rename it over `path`.
/// Flatten a path into a single file name, keeping distinct paths distinct.
pub(crate) fn escape_file_name(path: &str) -> String {
    path.replace('%', "%25")
        .replace('/', "%2F")
        .replace('\\', "%5C")
        .replace(':', "%3A")
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

/// Consolidated raw-detection tier.
pub struct RawCache {
    path: PathBuf,
    entries: Arc<RawEntries>,
    dirty: bool,
}

impl RawCache {
    /// Load the consolidated file. Missing or corrupt files yield an empty
    /// cache.
    pub fn load(path: &Path) -> Self {
        let entries = read_raw_file(path).unwrap_or_default();
        tracing::debug!(path = %path.display(), images = entries.len(), "raw cache loaded");
        Self {
            path: path.to_path_buf(),
            entries: Arc::new(entries),
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&[DetectedFace]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only view shared with workers for the duration of a scan.
    pub fn snapshot(&self) -> Arc<RawEntries> {
        Arc::clone(&self.entries)
    }

    /// Record detections for a new key. Existing keys are never overwritten;
    /// returns false when the key was already present.
    pub fn insert(&mut self, key: String, faces: Vec<DetectedFace>) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        Arc::make_mut(&mut self.entries).insert(key, faces);
        self.dirty = true;
        true
    }

    /// Read-modify-write the whole consolidated file.
    ///
    /// Entries already on disk win over in-memory ones for the same key, so
    /// a concurrent flush from another scan of the same root is not undone.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }

        let mut merged = read_raw_file(&self.path).unwrap_or_default();
        for (key, faces) in self.entries.iter() {
            merged.entry(key.clone()).or_insert_with(|| faces.clone());
        }

        let bytes = serde_json::to_vec(&merged)?;
        write_atomic(&self.path, &bytes).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), images = merged.len(), "raw cache flushed");

        self.entries = Arc::new(merged);
        self.dirty = false;
        Ok(())
    }
}

fn read_raw_file(path: &Path) -> Option<RawEntries> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "raw cache unreadable; treating as empty");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(entries) => Some(entries),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "raw cache corrupt; treating as empty");
            None
        }
    }
}

/// Per-image result tier.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    /// File holding the result for an image key. Keys are relative paths,
    /// so separators are escaped to keep one flat directory.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", escape_file_name(key)))
    }

    /// Cached result for an image. Corrupt files are logged and reported as
    /// absent so the image is resolved again.
    pub fn get(&self, key: &str) -> Option<ImageResult> {
        match self.read(key) {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(key, %error, "ignoring cached result");
                None
            }
        }
    }

    /// Like [`get`](Self::get) but distinguishes a corrupt file from a miss.
    pub fn read(&self, key: &str) -> Result<Option<ImageResult>, CacheError> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        match serde_json::from_slice::<ImageResult>(&bytes) {
            Ok(result) if result.image == key => Ok(Some(result)),
            Ok(result) => Err(CacheError::Corrupt {
                path,
                message: format!("holds result for {:?}", result.image),
            }),
            Err(e) => Err(CacheError::Corrupt {
                path,
                message: e.to_string(),
            }),
        }
    }

    pub fn put(&self, result: &ImageResult) -> Result<(), CacheError> {
        let path = self.path_for(&result.image);
        let bytes = serde_json::to_vec(result)?;
        write_atomic(&path, &bytes).map_err(|source| CacheError::Io { path, source })
    }
}

/// Both tiers for one scan root.
pub struct DiskCache {
    pub raw: RawCache,
    pub results: ResultCache,
}

impl DiskCache {
    /// Open (creating if absent) the cache rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        let results = ResultCache::open(&dir.join(RESULT_CACHE_DIR))?;
        let raw = RawCache::load(&dir.join(RAW_CACHE_FILE));
        Ok(Self { raw, results })
    }

    pub fn get_raw(&self, key: &str) -> Option<&[DetectedFace]> {
        self.raw.get(key)
    }

    pub fn put_raw(&mut self, key: String, faces: Vec<DetectedFace>) -> bool {
        self.raw.insert(key, faces)
    }

    pub fn get_image_result(&self, key: &str) -> Option<ImageResult> {
        self.results.get(key)
    }

    pub fn put_image_result(&self, result: &ImageResult) -> Result<(), CacheError> {
        self.results.put(result)
    }
}
