//! Two-level rebuild serialization.
//!
//! **In-process**: one `tokio::sync::Mutex` per project key, handed out from
//! a map behind a lightweight `std::sync::Mutex`. Unrelated projects rebuild
//! concurrently; callers for the same key queue up, and whoever wakes after
//! the winner re-checks validity instead of rebuilding again (request
//! coalescing happens at the service layer).
//!
//! **Cross-process**: a lock file created with `create_new` — O_CREAT|O_EXCL
//! is atomic, so exactly one process wins the race even when several detect
//! a stale lock simultaneously. The file body records the holder's pid and
//! acquisition time; a lock older than the stale timeout is presumed
//! abandoned and deleted, after which acquirers re-race on the next attempt.
//!
//! Acquisition is the only bounded operation in this crate: a retry loop
//! with exponential backoff, failing with [`IndexError::LockTimeout`] once
//! exhausted. The caller must not assume the resource is free after a
//! timeout.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::IndexError;

/// Contents of a lock file, for diagnostics and staleness checks.
#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    pid: u32,
    acquired_at: i64,
}

/// An acquired cross-process lock. Release is idempotent, and dropping an
/// unreleased lock releases it best-effort.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    released: bool,
}

impl BuildLock {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Hands out per-key in-process mutexes and cross-process file locks.
pub struct LockCoordinator {
    lock_root: PathBuf,
    config: LockConfig,
    key_mutexes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockCoordinator {
    pub fn new(lock_root: &Path, config: LockConfig) -> Self {
        Self {
            lock_root: lock_root.to_path_buf(),
            config,
            key_mutexes: Mutex::new(HashMap::new()),
        }
    }

    /// The in-process mutex for one project key. The same key always yields
    /// the same mutex for the lifetime of the coordinator.
    pub fn key_mutex(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.key_mutexes.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.lock_root.join(key).join("cache-build.lock")
    }

    /// Acquire the cross-process lock for `key`, retrying with exponential
    /// backoff while it is held by a live process.
    pub async fn acquire(&self, key: &str) -> Result<BuildLock> {
        let path = self.lock_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock dir {}", parent.display()))?;
        }

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    let body = LockBody {
                        pid: std::process::id(),
                        acquired_at: Utc::now().timestamp(),
                    };
                    // Body write failure does not void the lock: the file
                    // itself is the exclusion, the body is diagnostics.
                    if let Err(e) = serde_json::to_writer(&file, &body) {
                        debug!(error = %e, "could not write lock body");
                    }
                    return Ok(BuildLock {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.is_stale(&path) {
                        warn!(key, "reclaiming stale build lock");
                        // Deleting re-opens the create_new race; exactly one
                        // contender wins it on the next attempt.
                        let _ = std::fs::remove_file(&path);
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock file {}", path.display()));
                }
            }
        }

        Err(IndexError::LockTimeout {
            project_key: key.to_string(),
            attempts: self.config.max_attempts,
        }
        .into())
    }

    /// A lock is stale once its recorded acquisition time (or, failing
    /// that, the file mtime) is older than the configured timeout.
    fn is_stale(&self, path: &Path) -> bool {
        let timeout = self.config.stale_timeout_secs as i64;

        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(body) = serde_json::from_str::<LockBody>(&content) {
                return Utc::now().timestamp() - body.acquired_at > timeout;
            }
        }

        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age.as_secs() as i64 > timeout,
                Err(_) => false,
            },
            // Vanished between attempts: not stale, just gone
            Err(_) => false,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_min_ms << (attempt - 1).min(8);
        Duration::from_millis(exp.min(self.config.backoff_max_ms))
    }
}
