use crewscan_core::{NamingError, OracleError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of a scan or training unit, and of scan setup.
///
/// Per-unit variants are collected through the dispatcher's error channel
/// and never abort sibling units.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("identity {0} is already enrolled")]
    EnrollmentConflict(String),
    #[error("no faces found in {0} at any rotation; image left out of results")]
    NoFaceDetected(String),
    #[error(transparent)]
    MalformedIdentityKey(#[from] NamingError),
    #[error("worker failed on {unit}: {message}")]
    WorkerFailure { unit: String, message: String },
    #[error("cache file {} is corrupt: {message}", path.display())]
    CacheCorruption { path: PathBuf, message: String },
    #[error("{unit} timed out after {after:?}")]
    TimedOut { unit: String, after: Duration },
    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity {0} already has a record")]
    AlreadyExists(String),
    #[error("io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{} is corrupt: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },
    #[error("io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}
