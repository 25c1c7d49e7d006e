//! The caller-facing cache service.
//!
//! [`CacheService`] owns the mutex table, the store map, and the artifact
//! layout — one explicit object constructed once and passed by reference,
//! so isolated instances can coexist (notably in tests).
//!
//! # Rebuild protocol
//!
//! ```text
//! ensure_cache_built(project, sources, documents)
//!   └─ in-process key mutex          (serializes callers in this process)
//!        └─ validity check           (reuse if fingerprints match)
//!             └─ cross-process lock  (serializes across processes)
//!                  └─ re-check       (another process may have rebuilt
//!                                     while this one waited)
//!                       └─ rebuild → persist → release
//! ```
//!
//! Callers that waited on the key mutex find a valid cache on wake and
//! reuse the winner's result — N concurrent calls trigger exactly one
//! rebuild. A rebuild that was required but failed propagates its error;
//! an empty or partial store is never served as valid.
//!
//! Read-side `search` is deliberately not lock-protected: concurrent
//! readers may observe pre- or post-rebuild state depending on timing.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::builder::{Embedder, VectorBuilder};
use crate::cache::{project_key, CacheStore, SourceDescriptor};
use crate::chunk::ChunkingEngine;
use crate::config::Config;
use crate::models::{CacheRecord, DocumentSet};
use crate::store::{SearchResult, VectorStore};

/// Supplies the pre-parsed documents for a rebuild. Invoked only when the
/// cache is actually stale, so implementations may parse lazily.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load(&self) -> Result<DocumentSet>;
}

/// Outcome of [`CacheService::ensure_cache_built`].
#[derive(Debug, Clone)]
pub struct CacheHandle {
    pub project_key: String,
    /// Whether this call performed the rebuild (`true`) or reused an
    /// existing valid cache (`false`).
    pub rebuilt: bool,
    pub source_fingerprint: String,
    pub store_fingerprint: String,
    pub entry_count: usize,
    /// Opaque payload stored with the cache record, returned uninspected.
    pub payload: serde_json::Value,
}

pub struct CacheService {
    cache: CacheStore,
    locks: crate::lock::LockCoordinator,
    builder: VectorBuilder,
    embedder: Arc<dyn Embedder>,
    stores: RwLock<HashMap<String, Arc<VectorStore>>>,
}

impl CacheService {
    pub fn new(config: Config, embedder: Arc<dyn Embedder>) -> Self {
        let cache = CacheStore::new(&config.cache.root);
        let locks = crate::lock::LockCoordinator::new(&cache.lock_dir(), config.lock);
        let builder = VectorBuilder::new(ChunkingEngine::new(config.chunking));
        Self {
            cache,
            locks,
            builder,
            embedder,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Block until a valid cache exists for `project_path`, rebuilding
    /// under lock if necessary.
    ///
    /// `payload` is carried opaquely into the cache record on rebuild; on
    /// reuse the previously stored payload is returned instead.
    pub async fn ensure_cache_built(
        &self,
        project_path: &str,
        sources: &SourceDescriptor,
        documents: &dyn DocumentSource,
        payload: serde_json::Value,
    ) -> Result<CacheHandle> {
        let key = project_key(project_path);

        let key_mutex = self.locks.key_mutex(&key);
        let _guard = key_mutex.lock().await;

        if let Some(handle) = self.try_reuse(&key, project_path, sources)? {
            debug!(key, "cache valid, reusing");
            return Ok(handle);
        }

        let mut lock = self.locks.acquire(&key).await?;
        let result = self
            .rebuild_locked(&key, project_path, sources, documents, payload)
            .await;
        lock.release();
        result
    }

    /// Search the in-memory store for `project_path`, loading the persisted
    /// snapshot if none is resident yet.
    pub fn search(
        &self,
        project_path: &str,
        query: &[f32],
        top_k: usize,
        category_filter: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let key = project_key(project_path);
        let store = self.resident_store(&key, project_path)?;
        store.search(query, top_k, category_filter)
    }

    /// Drop the resident store and clear all on-disk artifacts for
    /// `project_path`. The next `ensure_cache_built` rebuilds from scratch.
    pub fn invalidate(&self, project_path: &str) {
        let key = project_key(project_path);
        self.stores.write().unwrap().remove(&key);
        self.cache.clear(&key);
        info!(key, "cache invalidated");
    }

    /// Reuse path: valid record + a resident/loadable store whose
    /// fingerprint matches it. Any mismatch (including a missing store file
    /// behind a valid record) fails closed and forces a rebuild.
    fn try_reuse(
        &self,
        key: &str,
        project_path: &str,
        sources: &SourceDescriptor,
    ) -> Result<Option<CacheHandle>> {
        if !self.cache.is_valid(key, sources)? {
            return Ok(None);
        }
        let record = match self.cache.load_record(key)? {
            Some(record) => record,
            None => return Ok(None),
        };

        let store = self.resident_store(key, project_path)?;
        if store.fingerprint() != record.vector_store_fingerprint {
            warn!(key, "cache record valid but store fingerprint differs, rebuilding");
            return Ok(None);
        }

        Ok(Some(CacheHandle {
            project_key: key.to_string(),
            rebuilt: false,
            source_fingerprint: record.fingerprint,
            store_fingerprint: record.vector_store_fingerprint,
            entry_count: store.len(),
            payload: record.payload,
        }))
    }

    async fn rebuild_locked(
        &self,
        key: &str,
        project_path: &str,
        sources: &SourceDescriptor,
        documents: &dyn DocumentSource,
        payload: serde_json::Value,
    ) -> Result<CacheHandle> {
        // Double-checked: another process may have completed a rebuild
        // while this one waited for the file lock.
        if let Some(handle) = self.try_reuse(key, project_path, sources)? {
            debug!(key, "cache became valid while waiting for lock");
            return Ok(handle);
        }

        let source_fingerprint = sources.current_fingerprint();
        let set = documents.load().await?;
        let store = self
            .builder
            .build(project_path, &set, self.embedder.as_ref())
            .await?;

        info!(key, entries = store.len(), "rebuilt vector store");

        // Persistence is best-effort: a failed write means the next access
        // rebuilds again, nothing worse.
        if let Err(e) = store.save(&self.cache.store_path(key)) {
            warn!(key, error = %e, "failed to persist vector store");
        }

        let record = CacheRecord {
            project_key: key.to_string(),
            fingerprint: source_fingerprint.clone(),
            indexed_at: Utc::now(),
            vector_store_fingerprint: store.fingerprint().to_string(),
            payload: payload.clone(),
        };
        self.cache.save(key, &record);

        let entry_count = store.len();
        let store_fingerprint = store.fingerprint().to_string();
        self.stores
            .write()
            .unwrap()
            .insert(key.to_string(), Arc::new(store));

        Ok(CacheHandle {
            project_key: key.to_string(),
            rebuilt: true,
            source_fingerprint,
            store_fingerprint,
            entry_count,
            payload,
        })
    }

    /// The store for `key`: resident if present, otherwise loaded from the
    /// persisted snapshot (a missing snapshot loads as empty).
    fn resident_store(&self, key: &str, project_path: &str) -> Result<Arc<VectorStore>> {
        if let Some(store) = self.stores.read().unwrap().get(key) {
            return Ok(store.clone());
        }

        let loaded = VectorStore::load(&self.cache.store_path(key), project_path, "unknown")?;
        let store = Arc::new(loaded);
        self.stores
            .write()
            .unwrap()
            .insert(key.to_string(), store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModelInfo;
    use crate::cache::{FolderSource, SourceDescriptor};
    use crate::config::{CacheConfig, ChunkingConfig, LockConfig};
    use crate::models::SourceDocument;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingEmbedder {
        batch_calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "counting".to_string(),
                version: "1".to_string(),
                dimensions: 3,
            }
        }
    }

    struct StaticSource {
        set: DocumentSet,
    }

    #[async_trait]
    impl DocumentSource for StaticSource {
        async fn load(&self) -> Result<DocumentSet> {
            Ok(self.set.clone())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        service: CacheService,
        embedder: Arc<CountingEmbedder>,
        project: String,
        sources: SourceDescriptor,
        documents: StaticSource,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let docs_dir = tmp.path().join("docs");
        std::fs::create_dir(&docs_dir).unwrap();
        std::fs::write(docs_dir.join("sop.md"), "# SOP\n\nStep one. Step two.").unwrap();

        let config = Config {
            cache: CacheConfig {
                root: tmp.path().join("cache"),
            },
            chunking: ChunkingConfig::default(),
            lock: LockConfig {
                stale_timeout_secs: 60,
                max_attempts: 3,
                backoff_min_ms: 1,
                backoff_max_ms: 4,
            },
        };

        let embedder = Arc::new(CountingEmbedder {
            batch_calls: AtomicUsize::new(0),
        });
        let service = CacheService::new(config, embedder.clone());

        let project = tmp.path().display().to_string();
        let sources = SourceDescriptor {
            folders: vec![FolderSource {
                label: "docs".to_string(),
                path: docs_dir,
                exclude_dirs: vec![],
            }],
            files: vec![],
        };
        let documents = StaticSource {
            set: DocumentSet {
                procedures: vec![SourceDocument {
                    file_name: "sop.md".to_string(),
                    file_path: "docs/sop.md".to_string(),
                    content: "# SOP\n\nStep one. Step two.".to_string(),
                }],
                ..Default::default()
            },
        };

        Fixture {
            _tmp: tmp,
            service,
            embedder,
            project,
            sources,
            documents,
        }
    }

    #[tokio::test]
    async fn test_first_call_builds_second_reuses() {
        let f = fixture();

        let first = f
            .service
            .ensure_cache_built(&f.project, &f.sources, &f.documents, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert!(first.rebuilt);
        assert_eq!(first.entry_count, 1);

        let second = f
            .service
            .ensure_cache_built(&f.project, &f.sources, &f.documents, serde_json::json!({"n": 2}))
            .await
            .unwrap();
        assert!(!second.rebuilt);
        assert_eq!(second.store_fingerprint, first.store_fingerprint);
        // Reuse returns the stored payload, not the new one
        assert_eq!(second.payload, serde_json::json!({"n": 1}));

        assert_eq!(f.embedder.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let f = fixture();

        f.service
            .ensure_cache_built(&f.project, &f.sources, &f.documents, serde_json::Value::Null)
            .await
            .unwrap();
        f.service.invalidate(&f.project);

        let again = f
            .service
            .ensure_cache_built(&f.project, &f.sources, &f.documents, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(again.rebuilt);
        assert_eq!(f.embedder.batch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_store_behind_valid_record_fails_closed() {
        let f = fixture();

        let first = f
            .service
            .ensure_cache_built(&f.project, &f.sources, &f.documents, serde_json::Value::Null)
            .await
            .unwrap();

        // Simulate loss of the store file while the record stays valid
        let key = first.project_key.clone();
        std::fs::remove_file(f.service.cache.store_path(&key)).unwrap();
        f.service.stores.write().unwrap().remove(&key);

        let again = f
            .service
            .ensure_cache_built(&f.project, &f.sources, &f.documents, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(again.rebuilt, "an empty store must never be served as valid");
    }

    #[tokio::test]
    async fn test_search_after_build() {
        let f = fixture();
        f.service
            .ensure_cache_built(&f.project, &f.sources, &f.documents, serde_json::Value::Null)
            .await
            .unwrap();

        // The fake embedder encodes text length in the first component, so
        // any same-direction query matches with similarity 1.0.
        let content_len = "# SOP\n\nStep one. Step two.".len() as f32;
        let results = f
            .service
            .search(&f.project, &[content_len, 1.0, 0.0], 5, None)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.file_name, "sop.md");
    }

    #[tokio::test]
    async fn test_search_unbuilt_project_is_empty() {
        let f = fixture();
        let results = f.service.search(&f.project, &[1.0, 0.0, 0.0], 5, None).unwrap();
        assert!(results.is_empty());
    }
}
