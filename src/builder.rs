//! Deterministic vector store construction.
//!
//! [`VectorBuilder`] turns a [`DocumentSet`] into a populated
//! [`VectorStore`] using an injected [`Embedder`]. The embedding model
//! itself is out of scope; only its interface lives here.
//!
//! # Determinism protocol
//!
//! Rebuilds from the same sources must produce byte-identical stores
//! (timestamps aside), because entry ids encode chunk positions and the
//! store file is compared across processes. Three rules enforce this:
//!
//! 1. Documents are sorted by file name within each category before
//!    processing.
//! 2. Documents are embedded strictly sequentially — concurrent embedding
//!    calls would complete in nondeterministic order.
//! 3. Category precedence is fixed: every procedure entry is inserted
//!    before any context entry. This is not caller-configurable.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::chunk::ChunkingEngine;
use crate::models::{content_hash, entry_id, DocumentSet, EntryMetadata, SourceDocument, VectorEntry};
use crate::store::VectorStore;

pub const CATEGORY_PROCEDURE: &str = "procedure";
pub const CATEGORY_CONTEXT: &str = "context";

/// Identity of the embedding model behind an [`Embedder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub dimensions: usize,
}

impl ModelInfo {
    /// Version string recorded in store fingerprints, e.g.
    /// `text-embedder@2024-05`.
    pub fn version_tag(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Injected embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_info(&self) -> ModelInfo;
}

/// Orchestrates chunking, embedding, and ordered insertion.
#[derive(Debug, Clone)]
pub struct VectorBuilder {
    chunker: ChunkingEngine,
}

impl VectorBuilder {
    pub fn new(chunker: ChunkingEngine) -> Self {
        Self { chunker }
    }

    /// Build a fresh store from `documents`.
    ///
    /// Chunks of one document are batch-embedded together; a batch result
    /// whose length does not match the chunk count is a contract violation.
    pub async fn build(
        &self,
        project_path: &str,
        documents: &DocumentSet,
        embedder: &dyn Embedder,
    ) -> Result<VectorStore> {
        let model_version = embedder.model_info().version_tag();
        let mut store = VectorStore::new(project_path, &model_version);

        self.insert_category(
            &mut store,
            CATEGORY_PROCEDURE,
            &documents.procedures,
            Some(&documents.subcategories),
            embedder,
        )
        .await?;
        self.insert_category(&mut store, CATEGORY_CONTEXT, &documents.contexts, None, embedder)
            .await?;

        Ok(store)
    }

    async fn insert_category(
        &self,
        store: &mut VectorStore,
        category: &str,
        documents: &[SourceDocument],
        subcategories: Option<&std::collections::HashMap<String, String>>,
        embedder: &dyn Embedder,
    ) -> Result<()> {
        let mut sorted: Vec<&SourceDocument> = documents.iter().collect();
        sorted.sort_by(|a, b| a.file_name.cmp(&b.file_name));

        for doc in sorted {
            let chunks = self.chunker.chunk_document(&doc.file_path, &doc.content);
            if chunks.is_empty() {
                continue;
            }

            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let vectors = embedder.embed_batch(&texts).await?;
            if vectors.len() != chunks.len() {
                bail!(
                    "embedder returned {} vectors for {} chunks of {}",
                    vectors.len(),
                    chunks.len(),
                    doc.file_path
                );
            }

            let subcategory = subcategories.and_then(|m| m.get(&doc.file_name).cloned());

            for (chunk, embedding) in chunks.iter().zip(vectors) {
                let hash = content_hash(&chunk.content);
                let entry = VectorEntry {
                    id: entry_id(&chunk.file_path, chunk.chunk_index, &hash),
                    embedding,
                    metadata: EntryMetadata {
                        file_name: doc.file_name.clone(),
                        file_path: doc.file_path.clone(),
                        category: category.to_string(),
                        chunk_index: chunk.chunk_index,
                        content: chunk.content.clone(),
                        content_hash: hash,
                        subcategory: subcategory.clone(),
                    },
                };
                store.add_entry(entry)?;
            }
        }

        Ok(())
    }
}
