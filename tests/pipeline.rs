//! End-to-end tests over the public surface: ensure, search, invalidate,
//! with real files on disk and a deterministic in-memory embedder.

use anyhow::Result;
use async_trait::async_trait;
use knowledge_index::builder::{Embedder, ModelInfo};
use knowledge_index::cache::{project_key, FolderSource, SourceDescriptor};
use knowledge_index::config::{CacheConfig, ChunkingConfig, Config, LockConfig};
use knowledge_index::models::{DocumentSet, SourceDocument};
use knowledge_index::service::{CacheService, DocumentSource};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Embeds text as a function of its bytes, so identical corpora always
/// produce identical vectors. Counts builds for coalescing assertions.
struct HashingEmbedder {
    batch_calls: AtomicUsize,
}

impl HashingEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batch_calls: AtomicUsize::new(0),
        })
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let mut acc = [0.0f32; 4];
        for (i, b) in text.bytes().enumerate() {
            acc[i % 4] += b as f32;
        }
        acc.to_vec()
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "hashing".to_string(),
            version: "1".to_string(),
            dimensions: 4,
        }
    }
}

/// Reads every `.md` file in a folder as a procedure document.
struct FolderDocuments {
    dir: PathBuf,
}

#[async_trait]
impl DocumentSource for FolderDocuments {
    async fn load(&self) -> Result<DocumentSet> {
        let mut procedures = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            procedures.push(SourceDocument {
                file_path: format!("docs/{file_name}"),
                file_name,
                content: fs::read_to_string(&path)?,
            });
        }
        Ok(DocumentSet {
            procedures,
            ..Default::default()
        })
    }
}

fn test_config(cache_root: &Path) -> Config {
    Config {
        cache: CacheConfig {
            root: cache_root.to_path_buf(),
        },
        chunking: ChunkingConfig::default(),
        lock: LockConfig {
            stale_timeout_secs: 60,
            max_attempts: 5,
            backoff_min_ms: 1,
            backoff_max_ms: 8,
        },
    }
}

fn seed_docs(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("intake.md"),
        "# Intake\n\nCollect the request form. Verify the signature.",
    )
    .unwrap();
    fs::write(
        dir.join("review.md"),
        "# Review\n\nAssign a reviewer. Record the verdict.",
    )
    .unwrap();
}

struct Env {
    _tmp: TempDir,
    cache_root: PathBuf,
    docs_dir: PathBuf,
    project: String,
}

impl Env {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let docs_dir = tmp.path().join("docs");
        seed_docs(&docs_dir);
        Env {
            cache_root: tmp.path().join("cache"),
            project: tmp.path().display().to_string(),
            docs_dir,
            _tmp: tmp,
        }
    }

    fn sources(&self) -> SourceDescriptor {
        SourceDescriptor {
            folders: vec![FolderSource {
                label: "docs".to_string(),
                path: self.docs_dir.clone(),
                exclude_dirs: vec![],
            }],
            files: vec![],
        }
    }

    fn documents(&self) -> FolderDocuments {
        FolderDocuments {
            dir: self.docs_dir.clone(),
        }
    }
}

#[tokio::test]
async fn test_build_search_invalidate_cycle() {
    let env = Env::new();
    let embedder = HashingEmbedder::new();
    let service = CacheService::new(test_config(&env.cache_root), embedder.clone());

    let handle = service
        .ensure_cache_built(&env.project, &env.sources(), &env.documents(), serde_json::Value::Null)
        .await
        .unwrap();
    assert!(handle.rebuilt);
    assert_eq!(handle.entry_count, 2);

    let query = HashingEmbedder::vector_for(
        "# Intake\n\nCollect the request form. Verify the signature.",
    );
    let hits = service.search(&env.project, &query, 1, None).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata.file_name, "intake.md");
    assert!((hits[0].similarity - 1.0).abs() < 1e-6);

    service.invalidate(&env.project);
    let hits = service.search(&env.project, &query, 1, None).unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_concurrent_calls_coalesce_to_one_rebuild() {
    let env = Env::new();
    let embedder = HashingEmbedder::new();
    let service = Arc::new(CacheService::new(
        test_config(&env.cache_root),
        embedder.clone(),
    ));

    let env = Arc::new(env);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let env = env.clone();
        tasks.push(tokio::spawn(async move {
            service
                .ensure_cache_built(
                    &env.project,
                    &env.sources(),
                    &env.documents(),
                    serde_json::Value::Null,
                )
                .await
                .unwrap()
        }));
    }

    let mut rebuilds = 0;
    for task in tasks {
        let handle = task.await.unwrap();
        if handle.rebuilt {
            rebuilds += 1;
        }
        assert_eq!(handle.entry_count, 2);
    }
    assert_eq!(rebuilds, 1, "exactly one caller may perform the rebuild");

    // Each of the two documents is embedded in one batch, once, ever
    assert_eq!(embedder.batch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rebuild_is_deterministic_across_services() {
    let env_a = Env::new();
    let env_b = Env::new();

    let service_a = CacheService::new(test_config(&env_a.cache_root), HashingEmbedder::new());
    let service_b = CacheService::new(test_config(&env_b.cache_root), HashingEmbedder::new());

    let a = service_a
        .ensure_cache_built(
            "/projects/same",
            &env_a.sources(),
            &env_a.documents(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    let b = service_b
        .ensure_cache_built(
            "/projects/same",
            &env_b.sources(),
            &env_b.documents(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();

    assert_eq!(a.store_fingerprint, b.store_fingerprint);
    assert_eq!(a.entry_count, b.entry_count);
}

#[tokio::test]
async fn test_persisted_cache_survives_service_restart() {
    let env = Env::new();

    let first_embedder = HashingEmbedder::new();
    {
        let service = CacheService::new(test_config(&env.cache_root), first_embedder.clone());
        let handle = service
            .ensure_cache_built(&env.project, &env.sources(), &env.documents(), serde_json::Value::Null)
            .await
            .unwrap();
        assert!(handle.rebuilt);
    }

    // A fresh service over the same cache root must reuse from disk
    let second_embedder = HashingEmbedder::new();
    let service = CacheService::new(test_config(&env.cache_root), second_embedder.clone());
    let handle = service
        .ensure_cache_built(&env.project, &env.sources(), &env.documents(), serde_json::Value::Null)
        .await
        .unwrap();
    assert!(!handle.rebuilt);
    assert_eq!(second_embedder.batch_calls.load(Ordering::SeqCst), 0);

    let query = HashingEmbedder::vector_for(
        "# Review\n\nAssign a reviewer. Record the verdict.",
    );
    let hits = service.search(&env.project, &query, 1, None).unwrap();
    assert_eq!(hits[0].metadata.file_name, "review.md");
}

#[tokio::test]
async fn test_source_change_triggers_rebuild() {
    let env = Env::new();
    let embedder = HashingEmbedder::new();
    let service = CacheService::new(test_config(&env.cache_root), embedder.clone());

    let first = service
        .ensure_cache_built(&env.project, &env.sources(), &env.documents(), serde_json::Value::Null)
        .await
        .unwrap();

    fs::write(
        env.docs_dir.join("appeal.md"),
        "# Appeal\n\nFile within thirty days.",
    )
    .unwrap();

    let second = service
        .ensure_cache_built(&env.project, &env.sources(), &env.documents(), serde_json::Value::Null)
        .await
        .unwrap();
    assert!(second.rebuilt);
    assert_ne!(second.source_fingerprint, first.source_fingerprint);
    assert_eq!(second.entry_count, 3);
}

#[tokio::test]
async fn test_stale_foreign_lock_does_not_block_rebuild() {
    let env = Env::new();
    let service = CacheService::new(test_config(&env.cache_root), HashingEmbedder::new());

    // Plant an hours-old lock file from a process that no longer exists
    let key = project_key(&env.project);
    let lock_path = env
        .cache_root
        .join("locks")
        .join(&key)
        .join("cache-build.lock");
    fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    fs::write(
        &lock_path,
        format!(
            r#"{{"pid": 999999, "acquired_at": {}}}"#,
            chrono::Utc::now().timestamp() - 7200
        ),
    )
    .unwrap();

    let handle = service
        .ensure_cache_built(&env.project, &env.sources(), &env.documents(), serde_json::Value::Null)
        .await
        .unwrap();
    assert!(handle.rebuilt);
    // The winner released its own lock after building
    assert!(!lock_path.exists());
}

#[tokio::test]
async fn test_payload_round_trips_through_reuse() {
    let env = Env::new();
    let service = CacheService::new(test_config(&env.cache_root), HashingEmbedder::new());

    let payload = serde_json::json!({"document_count": 2, "source": "docs"});
    service
        .ensure_cache_built(&env.project, &env.sources(), &env.documents(), payload.clone())
        .await
        .unwrap();

    let reused = service
        .ensure_cache_built(
            &env.project,
            &env.sources(),
            &env.documents(),
            serde_json::json!({"ignored": true}),
        )
        .await
        .unwrap();
    assert!(!reused.rebuilt);
    assert_eq!(reused.payload, payload);
}
