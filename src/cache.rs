//! Cache-validity records and per-project artifact layout.
//!
//! Each project gets a short key derived from a hash of its absolute path,
//! which keeps artifact paths bounded and filesystem-safe:
//!
//! ```text
//! <root>/vector-store/<key>/vector-store.json
//! <root>/metadata/<key>/cache-metadata.json
//! <root>/locks/<key>/cache-build.lock
//! ```
//!
//! Validity is a fingerprint comparison: the record stores the combined
//! source fingerprint at build time, and [`CacheStore::is_valid`] recomputes
//! it from the current on-disk state. The cache is an optimization, never a
//! correctness dependency — a failed write is logged and swallowed, and the
//! next access simply rebuilds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::error::IndexError;
use crate::fingerprint::{combined_fingerprint, file_fingerprint, folder_fingerprint};
use crate::models::CacheRecord;

/// A folder tracked for cache validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSource {
    pub label: String,
    pub path: PathBuf,
    #[serde(default)]
    pub exclude_dirs: Vec<String>,
}

/// A single file tracked for cache validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    pub label: String,
    pub path: PathBuf,
}

/// The set of filesystem inputs whose state decides whether a cached index
/// is still valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceDescriptor {
    #[serde(default)]
    pub folders: Vec<FolderSource>,
    #[serde(default)]
    pub files: Vec<FileSource>,
}

impl SourceDescriptor {
    /// Combined fingerprint of the current on-disk state of every part.
    ///
    /// Missing paths contribute the sentinel digest, so descriptors over
    /// not-yet-created folders are comparable rather than erroneous.
    pub fn current_fingerprint(&self) -> String {
        let mut parts: Vec<(&str, String)> = Vec::new();
        for folder in &self.folders {
            let excludes: Vec<&str> = folder.exclude_dirs.iter().map(|s| s.as_str()).collect();
            parts.push((&folder.label, folder_fingerprint(&folder.path, &excludes)));
        }
        for file in &self.files {
            parts.push((&file.label, file_fingerprint(&file.path)));
        }
        combined_fingerprint(&parts)
    }
}

/// Short, filesystem-safe key for a project path.
pub fn project_key(project_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Persists and validates cache records, and owns the artifact layout.
pub struct CacheStore {
    root: PathBuf,
    records: RwLock<HashMap<String, CacheRecord>>,
}

impl CacheStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn store_path(&self, key: &str) -> PathBuf {
        self.root.join("vector-store").join(key).join("vector-store.json")
    }

    pub fn metadata_path(&self, key: &str) -> PathBuf {
        self.root.join("metadata").join(key).join("cache-metadata.json")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Whether the record for `key` matches the current source state.
    ///
    /// Absence of a record (memory and disk) means invalid — never an
    /// error. A record that exists but cannot be parsed is
    /// [`IndexError::CorruptPersisted`].
    pub fn is_valid(&self, key: &str, sources: &SourceDescriptor) -> Result<bool> {
        let record = match self.load_record(key)? {
            Some(record) => record,
            None => return Ok(false),
        };
        Ok(record.fingerprint == sources.current_fingerprint())
    }

    /// Fetch the record for `key`, memory first, then durable storage.
    pub fn load_record(&self, key: &str) -> Result<Option<CacheRecord>> {
        if let Some(record) = self.records.read().unwrap().get(key) {
            return Ok(Some(record.clone()));
        }

        let path = self.metadata_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache record at {}", path.display()))?;
        let record: CacheRecord =
            serde_json::from_str(&content).map_err(|e| IndexError::CorruptPersisted {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        self.records
            .write()
            .unwrap()
            .insert(key.to_string(), record.clone());
        Ok(Some(record))
    }

    /// Persist a record. Write failures are logged and swallowed; the next
    /// access rebuilds instead of reading a durable cache.
    pub fn save(&self, key: &str, record: &CacheRecord) {
        self.records
            .write()
            .unwrap()
            .insert(key.to_string(), record.clone());

        let path = self.metadata_path(key);
        let result = (|| -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(record)?;
            std::fs::write(&path, json)?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(key, error = %e, "failed to persist cache record; continuing without durable cache");
        }
    }

    /// Best-effort removal of every derived artifact for `key`. Missing
    /// files are not errors.
    pub fn clear(&self, key: &str) {
        self.records.write().unwrap().remove(key);

        for path in [self.store_path(key), self.metadata_path(key)] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "could not remove cache artifact");
                }
            }
            // Drop the now-empty per-key directory as well
            if let Some(parent) = path.parent() {
                let _ = std::fs::remove_dir(parent);
            }
        }
    }
}
