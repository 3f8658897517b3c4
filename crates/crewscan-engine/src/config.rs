use crate::cache::escape_file_name;
use crate::error::{ConfigError, StoreError};
use crate::store::{FileStore, IdentityStore, SqliteStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cache directory created under a scan root when none is configured.
pub const DEFAULT_CACHE_DIR_NAME: &str = ".crewscan-cache";

/// Where identity records are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One JSON record per identity in `identity_dir`.
    Files,
    /// SQLite database at `db_path`.
    Sqlite,
}

/// Engine configuration.
///
/// Built from defaults, then an optional TOML file, then `CREWSCAN_*`
/// environment variables. The CLI applies its flags last.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for identities, database and models.
    pub data_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub store: StoreKind,
    /// Record directory for [`StoreKind::Files`].
    pub identity_dir: PathBuf,
    /// Database file for [`StoreKind::Sqlite`].
    pub db_path: PathBuf,
    /// Cache directory. `None` puts the cache under each scan root.
    pub cache_dir: Option<PathBuf>,
    /// Maximum number of images processed at once.
    pub workers: usize,
    /// Per-unit timeout in seconds; 0 disables it.
    pub unit_timeout_secs: u64,
    /// Cosine similarity threshold for a positive match (ONNX oracle).
    pub similarity_threshold: f32,
    /// Collapse overlapping detections found at different rotations.
    pub merge_rotations: bool,
    /// Lowercase file extensions treated as images.
    pub image_extensions: Vec<String>,
    /// Descend into sub-directories when scanning.
    pub recursive: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            identity_dir: data_dir.join("identities"),
            db_path: data_dir.join("identities.db"),
            data_dir,
            store: StoreKind::Files,
            cache_dir: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            unit_timeout_secs: 0,
            similarity_threshold: 0.40,
            merge_rotations: false,
            image_extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            recursive: false,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.with_env())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CREWSCAN_*` environment variables over the current values.
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("CREWSCAN_DATA_DIR") {
            let dir = PathBuf::from(dir);
            self.model_dir = dir.join("models");
            self.identity_dir = dir.join("identities");
            self.db_path = dir.join("identities.db");
            self.data_dir = dir;
        }
        if let Ok(dir) = std::env::var("CREWSCAN_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CREWSCAN_IDENTITY_DIR") {
            self.identity_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("CREWSCAN_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("CREWSCAN_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        match std::env::var("CREWSCAN_STORE").as_deref() {
            Ok("sqlite") => self.store = StoreKind::Sqlite,
            Ok("files") => self.store = StoreKind::Files,
            _ => {}
        }
        self.workers = env_parse("CREWSCAN_WORKERS", self.workers);
        self.unit_timeout_secs = env_parse("CREWSCAN_UNIT_TIMEOUT_SECS", self.unit_timeout_secs);
        self.similarity_threshold =
            env_parse("CREWSCAN_SIMILARITY_THRESHOLD", self.similarity_threshold);
        if let Ok(v) = std::env::var("CREWSCAN_MERGE_ROTATIONS") {
            self.merge_rotations = v != "0";
        }
        if let Ok(v) = std::env::var("CREWSCAN_RECURSIVE") {
            self.recursive = v != "0";
        }
        self
    }

    /// Cache directory used for a given scan root.
    ///
    /// A configured `cache_dir` is shared, so each root gets its own
    /// sub-directory named after its canonical path. Image keys are only
    /// unique within one root.
    pub fn cache_dir_for(&self, root: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(shared) => {
                let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
                shared.join(escape_file_name(&root.to_string_lossy()))
            }
            None => root.join(DEFAULT_CACHE_DIR_NAME),
        }
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        (self.unit_timeout_secs > 0).then(|| Duration::from_secs(self.unit_timeout_secs))
    }

    /// Whether `path` has one of the configured image extensions.
    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                self.image_extensions.iter().any(|x| *x == e)
            })
            .unwrap_or(false)
    }

    /// Open the configured identity store.
    pub fn open_store(&self) -> Result<Box<dyn IdentityStore>, StoreError> {
        Ok(match self.store {
            StoreKind::Files => Box::new(FileStore::open(&self.identity_dir)?),
            StoreKind::Sqlite => Box::new(SqliteStore::open(&self.db_path)?),
        })
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("crewscan")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
