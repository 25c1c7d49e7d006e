//! Core data models for the knowledge index.
//!
//! These types represent the documents, chunks, vector entries, and cache
//! records that flow through the build and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A pre-parsed source document, as handed over by the document-extraction
/// layer. Parsing binary formats is out of scope for this crate.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub file_name: String,
    pub file_path: String,
    pub content: String,
}

/// Source documents grouped by category.
///
/// Procedure documents always precede context documents in the built store;
/// the ordering is fixed so that two builds from identical sources produce
/// identical stores.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    pub procedures: Vec<SourceDocument>,
    pub contexts: Vec<SourceDocument>,
    /// Optional subcategory tag per procedure file name (e.g. an SOP class).
    pub subcategories: std::collections::HashMap<String, String>,
}

/// A transient chunk of document text, alive only until it is embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    pub content: String,
    pub file_path: String,
    pub chunk_index: usize,
    pub chunk_total: usize,
}

/// Metadata carried alongside every embedded chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    pub file_name: String,
    pub file_path: String,
    pub category: String,
    pub chunk_index: usize,
    pub content: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
}

/// One embedded chunk: a deterministic id, its vector, and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorEntry {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: EntryMetadata,
}

/// Cache-validity record persisted alongside the vector store.
///
/// Superseded (rewritten whole) on every successful rebuild, never mutated
/// in place. `payload` is opaque: the cache layer stores and returns it but
/// never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub project_key: String,
    pub fingerprint: String,
    pub indexed_at: DateTime<Utc>,
    pub vector_store_fingerprint: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// SHA-256 of a text, hex-encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic entry id: a pure function of the chunk's file path, index,
/// and content hash. The unit separator keeps the three fields unambiguous.
pub fn entry_id(file_path: &str, chunk_index: usize, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0x1f]);
    hasher.update(chunk_index.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(content_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}
