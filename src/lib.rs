//! # Knowledge Index
//!
//! A concurrency-safe, content-addressed caching layer around a brute-force
//! vector similarity index.
//!
//! Knowledge Index keeps a per-project semantic index over a corpus of
//! source documents. Callers declare which folders and files the index is
//! derived from; the service fingerprints that source material, rebuilds the
//! index only when the fingerprint changes, and serializes rebuilds both
//! within a process and across processes so concurrent callers coalesce onto
//! a single build.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Documents   │──▶│   Builder    │──▶│  VectorStore  │
//! │ (injected)  │   │ Chunk+Embed  │   │  JSON on disk │
//! └─────────────┘   └──────────────┘   └──────┬────────┘
//!        ▲                                    │
//!        │          ┌──────────────┐          ▼
//!   rebuild only    │ CacheService │    cosine search
//!   when stale ◀────│ locks + fps  │
//!                   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! # use knowledge_index::builder::Embedder;
//! # use knowledge_index::cache::SourceDescriptor;
//! # use knowledge_index::config::Config;
//! # use knowledge_index::service::{CacheService, DocumentSource};
//! # use std::sync::Arc;
//! # async fn run(config: Config, embedder: Arc<dyn Embedder>, documents: &dyn DocumentSource) -> anyhow::Result<()> {
//! let service = CacheService::new(config, embedder);
//! let sources = SourceDescriptor::default();
//!
//! let handle = service
//!     .ensure_cache_built("/projects/acme", &sources, documents, serde_json::Value::Null)
//!     .await?;
//! println!("rebuilt: {}, entries: {}", handle.rebuilt, handle.entry_count);
//!
//! let hits = service.search("/projects/acme", &[0.1, 0.2, 0.3], 5, None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and content addressing |
//! | [`error`] | Typed failures callers branch on |
//! | [`fingerprint`] | Filesystem state digests |
//! | [`chunk`] | Structure-aware text chunking |
//! | [`builder`] | Deterministic store construction |
//! | [`store`] | Brute-force vector store with persistence |
//! | [`cache`] | Validity records and artifact layout |
//! | [`lock`] | In-process and cross-process rebuild locks |
//! | [`service`] | The exposed surface: ensure, search, invalidate |

pub mod builder;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod models;
pub mod service;
pub mod store;
