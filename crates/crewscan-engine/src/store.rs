//! Persisted identity records.

use crate::cache::write_atomic;
use crate::error::StoreError;
use crewscan_core::{Embedding, Identity};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Create and bulk-read identity records. Records are written once.
pub trait IdentityStore: Send {
    fn load_all(&self) -> Result<Vec<Identity>, StoreError>;
    fn save(&self, identity: &Identity) -> Result<(), StoreError>;
}

/// One JSON file per identity, `<key>.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl IdentityStore for FileStore {
    fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|e| e == "json"))
            .collect();
        paths.sort();

        let mut identities = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<Identity>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(identity) => identities.push(identity),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable identity record")
                }
            }
        }
        Ok(identities)
    }

    fn save(&self, identity: &Identity) -> Result<(), StoreError> {
        let path = self.record_path(&identity.key);
        if path.exists() {
            return Err(StoreError::AlreadyExists(identity.key.clone()));
        }
        let bytes = serde_json::to_vec_pretty(identity)?;
        write_atomic(&path, &bytes).map_err(|source| StoreError::Io { path, source })
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS countries (
    code TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS identities (
    key         TEXT PRIMARY KEY,
    first_name  TEXT NOT NULL,
    middle_name TEXT,
    last_name   TEXT NOT NULL,
    country     TEXT NOT NULL REFERENCES countries(code),
    embedding   BLOB,
    enrolled_at TEXT
);
";

/// SQLite-backed identity records. Embeddings are little-endian `f32` blobs.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

impl IdentityStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, first_name, middle_name, last_name, country, embedding, enrolled_at
             FROM identities ORDER BY key",
        )?;
        let rows = stmt.query_map([], |row| {
            let embedding: Option<Vec<u8>> = row.get(5)?;
            Ok(Identity {
                key: row.get(0)?,
                first_name: row.get(1)?,
                middle_name: row.get(2)?,
                last_name: row.get(3)?,
                country: row.get(4)?,
                embedding: embedding.map(|b| Embedding::from_le_bytes(&b)),
                enrolled_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn save(&self, identity: &Identity) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT key FROM identities WHERE key = ?1",
                params![identity.key],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::AlreadyExists(identity.key.clone()));
        }

        tx.execute(
            "INSERT OR IGNORE INTO countries (code) VALUES (?1)",
            params![identity.country],
        )?;
        tx.execute(
            "INSERT INTO identities
             (key, first_name, middle_name, last_name, country, embedding, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                identity.key,
                identity.first_name,
                identity.middle_name,
                identity.last_name,
                identity.country,
                identity.embedding.as_ref().map(Embedding::to_le_bytes),
                identity.enrolled_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}
