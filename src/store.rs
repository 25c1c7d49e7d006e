//! In-memory vector store with a durable JSON snapshot.
//!
//! Entries are kept in insertion order with an id index on the side; upserts
//! replace in place so a rebuilt entry keeps its position. Search is
//! brute-force cosine similarity over all (optionally category-filtered)
//! entries — no ANN structures, by design.
//!
//! The store fingerprint is a digest over the sorted `id:content_hash`
//! pairs plus project path and model version: it changes iff entry
//! membership or content changes, and is independent of insertion order.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

use crate::error::IndexError;
use crate::models::{EntryMetadata, VectorEntry};

/// Two similarities closer than this are treated as tied and broken by id.
const TIE_EPSILON: f64 = 1e-10;

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub similarity: f64,
    pub metadata: EntryMetadata,
}

/// Durable snapshot shape. Field names are a stable interchange contract;
/// loaders tolerate unknown additional fields.
#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    project_path: String,
    entries: Vec<VectorEntry>,
    fingerprint: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    model_version: String,
    count: usize,
}

#[derive(Debug, Clone)]
pub struct VectorStore {
    project_path: String,
    model_version: String,
    entries: Vec<VectorEntry>,
    by_id: HashMap<String, usize>,
    fingerprint: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl VectorStore {
    pub fn new(project_path: &str, model_version: &str) -> Self {
        let now = Utc::now();
        let mut store = Self {
            project_path: project_path.to_string(),
            model_version: model_version.to_string(),
            entries: Vec::new(),
            by_id: HashMap::new(),
            fingerprint: String::new(),
            created_at: now,
            updated_at: now,
        };
        store.recompute_fingerprint();
        store
    }

    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn entries(&self) -> &[VectorEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upsert by id. An existing entry is replaced in place, keeping its
    /// position; a new one is appended.
    pub fn add_entry(&mut self, entry: VectorEntry) -> Result<()> {
        if let Some(first) = self.entries.first() {
            if first.embedding.len() != entry.embedding.len() {
                return Err(IndexError::DimensionMismatch {
                    expected: first.embedding.len(),
                    actual: entry.embedding.len(),
                }
                .into());
            }
        }

        match self.by_id.get(&entry.id) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.by_id.insert(entry.id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
        self.touch();
        Ok(())
    }

    /// Remove by id. Returns whether an entry was removed.
    pub fn remove_entry(&mut self, id: &str) -> bool {
        match self.by_id.remove(id) {
            Some(pos) => {
                self.entries.remove(pos);
                self.reindex();
                self.touch();
                true
            }
            None => false,
        }
    }

    /// Remove all entries for one source file. Returns the removed count.
    pub fn remove_entries_by_file(&mut self, file_path: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.metadata.file_path != file_path);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.reindex();
            self.touch();
        }
        removed
    }

    pub fn entries_by_category(&self, category: &str) -> Vec<&VectorEntry> {
        self.entries
            .iter()
            .filter(|e| e.metadata.category == category)
            .collect()
    }

    pub fn entries_by_file(&self, file_path: &str) -> Vec<&VectorEntry> {
        self.entries
            .iter()
            .filter(|e| e.metadata.file_path == file_path)
            .collect()
    }

    /// Brute-force cosine search.
    ///
    /// Results are sorted by descending similarity; similarities within
    /// [`TIE_EPSILON`] of each other are ordered by ascending entry id so
    /// the ranking is reproducible. Comparing vectors of different
    /// dimensions is a hard error; a zero-norm vector on either side scores
    /// `0.0`.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        category_filter: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let mut results: Vec<SearchResult> = Vec::new();

        for entry in &self.entries {
            if let Some(cat) = category_filter {
                if entry.metadata.category != cat {
                    continue;
                }
            }
            let similarity = cosine_similarity(query, &entry.embedding)?;
            results.push(SearchResult {
                id: entry.id.clone(),
                similarity,
                metadata: entry.metadata.clone(),
            });
        }

        results.sort_by(|a, b| {
            if (a.similarity - b.similarity).abs() < TIE_EPSILON {
                a.id.cmp(&b.id)
            } else {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }
        });
        results.truncate(top_k);

        Ok(results)
    }

    /// Write the JSON snapshot, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let snapshot = StoreSnapshot {
            project_path: self.project_path.clone(),
            entries: self.entries.clone(),
            fingerprint: self.fingerprint.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            model_version: self.model_version.clone(),
            count: self.entries.len(),
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write vector store to {}", path.display()))?;
        Ok(())
    }

    /// Load a snapshot.
    ///
    /// A missing file yields a fresh empty store scoped to `project_path` —
    /// absence is not an error. A file that exists but does not parse is a
    /// hard [`IndexError::CorruptPersisted`] error, never silently replaced
    /// with an empty store.
    pub fn load(path: &Path, project_path: &str, model_version: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(project_path, model_version));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vector store at {}", path.display()))?;

        let snapshot: StoreSnapshot =
            serde_json::from_str(&content).map_err(|e| IndexError::CorruptPersisted {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut store = Self {
            project_path: snapshot.project_path,
            model_version: snapshot.model_version,
            entries: snapshot.entries,
            by_id: HashMap::new(),
            fingerprint: String::new(),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        };
        store.reindex();
        store.recompute_fingerprint();
        Ok(store)
    }

    fn reindex(&mut self) {
        self.by_id = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.recompute_fingerprint();
    }

    fn recompute_fingerprint(&mut self) {
        let mut pairs: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}:{}", e.id, e.metadata.content_hash))
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        hasher.update(pairs.join("\n").as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.project_path.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.model_version.as_bytes());
        self.fingerprint = format!("{:x}", hasher.finalize());
    }
}

/// Cosine similarity in `[-1, 1]`, computed in f64 so the tie threshold is
/// meaningful. Zero-norm input on either side scores `0.0`; mismatched
/// dimensions are a contract violation.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(IndexError::DimensionMismatch {
            expected: b.len(),
            actual: a.len(),
        }
        .into());
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return Ok(0.0);
    }
    Ok(dot / denom)
}
