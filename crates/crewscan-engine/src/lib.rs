//! crewscan-engine: identity registry, disk cache, bounded job dispatcher
//! and scan orchestration on top of `crewscan-core`.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod report;
pub mod scanner;
pub mod store;

#[cfg(test)]
mod testing;

pub use cache::{DiskCache, RAW_CACHE_FILE, RESULT_CACHE_DIR};
pub use config::{Config, StoreKind, DEFAULT_CACHE_DIR_NAME};
pub use dispatcher::{DispatchReport, ErrorSink, Job, JobDispatcher, UnitFailure};
pub use error::{CacheError, ConfigError, ScanError, StoreError};
pub use registry::{Enrollment, IdentityRegistry};
pub use report::{CoOccurrenceGraph, PairRule};
pub use scanner::{ScanReport, ScanResult, Scanner, TrainReport};
pub use store::{FileStore, IdentityStore, SqliteStore};
