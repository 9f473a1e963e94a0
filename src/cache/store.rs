//! Cache blob storage.
//!
//! The store is an opaque key/value blob store. The filesystem store publishes
//! blobs atomically: bytes go to a temp file in the store directory and are
//! renamed into place only once fully written, so readers never observe a
//! partial blob and concurrent writers of one key resolve as last-write-wins.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tempfile::NamedTempFile;

use super::key::storage_name;
use crate::error::{CacheError, CacheResult};

/// Blob file extension.
const BLOB_EXTENSION: &str = "tar.gz";

/// A key/value blob store addressed by computed cache keys.
pub trait CacheStore: Send + Sync {
    /// Fetch the blob stored under exactly `key`.
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `bytes` under `key`, replacing any previous blob.
    fn put(&self, key: &str, bytes: &[u8]) -> CacheResult<()>;
}

/// Summary of a stored blob.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    /// Storage file name (without extension)
    pub name: String,

    /// Size in bytes
    pub size: u64,

    /// Last write time
    pub modified: Option<DateTime<Local>>,
}

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at `root` (created lazily on first write).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{BLOB_EXTENSION}", storage_name(key)))
    }

    /// List stored blobs, newest first.
    pub fn list(&self) -> CacheResult<Vec<CacheEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.root)?.filter_map(Result::ok) {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = file_name.strip_suffix(&format!(".{BLOB_EXTENSION}")) else {
                continue;
            };

            let metadata = entry.metadata()?;
            entries.push(CacheEntry {
                name: name.to_string(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Local>::from),
            });
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(entries)
    }

    /// Remove every stored blob. Returns the number removed.
    pub fn clear(&self) -> CacheResult<usize> {
        let entries = self.list()?;
        for entry in &entries {
            std::fs::remove_file(self.root.join(format!("{}.{BLOB_EXTENSION}", entry.name)))?;
        }
        Ok(entries.len())
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let path = self.blob_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> CacheResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| save_error(key, e))?;

        let mut temp = NamedTempFile::new_in(&self.root).map_err(|e| save_error(key, e))?;
        temp.write_all(bytes).map_err(|e| save_error(key, e))?;
        temp.as_file().sync_all().map_err(|e| save_error(key, e))?;
        temp.persist(self.blob_path(key)).map_err(|e| save_error(key, e.error))?;

        tracing::debug!(key, size = bytes.len(), "Cache blob published");
        Ok(())
    }
}

fn save_error(key: &str, error: impl std::fmt::Display) -> CacheError {
    CacheError::Save { key: key.to_string(), reason: error.to_string() }
}

/// Age of a blob, for display.
pub fn age(entry: &CacheEntry) -> Option<chrono::Duration> {
    entry.modified.map(|m| Local::now().signed_duration_since(m))
}
