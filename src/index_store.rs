//! Persisted per-folder vector index.
//!
//! [`FolderIndex`] pairs a [`FlatIndex`] with the name of the embedding
//! model that produced its vectors, and knows how to embed, save and load
//! itself. Saves go through a temp file and a rename, so a reader loading
//! the index mid-build sees the previous checkpoint, never a partial file.

use anyhow::{ensure, Result};
use std::path::Path;

use findme_core::embedding::Embedder;
use findme_core::models::StoredDocument;
use findme_core::store::flat::FlatIndex;
use findme_core::store::{ScoredDocument, SourceEntry, VectorStore};
use std::collections::HashMap;

use crate::error::SyncError;
use crate::layout::{path_key, write_atomic, INDEX_FILE};

#[derive(Debug, Clone)]
pub struct FolderIndex {
    store: FlatIndex,
    model: String,
}

impl FolderIndex {
    pub fn from_parts(store: FlatIndex, model: impl Into<String>) -> Self {
        Self {
            store,
            model: model.into(),
        }
    }

    /// Embed `docs` and build a new index from them.
    pub async fn from_documents(docs: Vec<StoredDocument>, embedder: &dyn Embedder) -> Result<Self> {
        let vectors = embed_contents(&docs, embedder).await?;
        Self::from_vectors(docs, vectors, embedder.model_name())
    }

    /// Embed `docs` and append them.
    pub async fn add_documents(&mut self, docs: Vec<StoredDocument>, embedder: &dyn Embedder) -> Result<()> {
        let vectors = embed_contents(&docs, embedder).await?;
        self.add_vectors(docs, vectors)
    }

    /// Build an index from documents that were already embedded.
    pub fn from_vectors(docs: Vec<StoredDocument>, vectors: Vec<Vec<f32>>, model: &str) -> Result<Self> {
        let store = FlatIndex::from_documents(docs, vectors)?;
        Ok(Self::from_parts(store, model))
    }

    /// Append documents that were already embedded.
    pub fn add_vectors(&mut self, docs: Vec<StoredDocument>, vectors: Vec<Vec<f32>>) -> Result<()> {
        self.store.add(docs, vectors)
    }

    /// Embed `query` and return the `k` nearest documents with their distances.
    pub async fn similarity_search_with_score(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let vector = embedder.embed_query(query).await?;
        self.store.search(&vector, k)
    }

    /// Write the index into `dir`, replacing any previous save atomically.
    pub fn save_local(&self, dir: &Path) -> Result<(), SyncError> {
        let bytes = self.store.encode(&self.model)?;
        write_atomic(&dir.join(INDEX_FILE), &bytes)?;
        Ok(())
    }

    /// Load the index saved in `dir`.
    ///
    /// When `expected_model` is given, an index built with another model is
    /// rejected, since its vectors are not comparable.
    pub fn load_local(dir: &Path, expected_model: Option<&str>) -> Result<Self, SyncError> {
        let store_err = |reason: String| SyncError::StoreLoad {
            path: path_key(dir),
            reason,
        };

        let bytes = std::fs::read(dir.join(INDEX_FILE)).map_err(|e| store_err(e.to_string()))?;
        let (store, model) = FlatIndex::decode(&bytes).map_err(|e| store_err(format!("{:#}", e)))?;

        if let Some(expected) = expected_model {
            if expected != model {
                return Err(store_err(format!(
                    "index was built with model {}, current model is {}",
                    model, expected
                )));
            }
        }
        Ok(Self { store, model })
    }

    /// New index holding only the documents `keep` accepts; vectors are reused.
    pub fn retain(&self, keep: &dyn Fn(&StoredDocument) -> bool) -> Result<Self> {
        Ok(Self {
            store: self.store.retain_subset(keep)?,
            model: self.model.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn sources(&self) -> &HashMap<String, SourceEntry> {
        self.store.sources()
    }

    pub fn documents(&self) -> impl Iterator<Item = &StoredDocument> {
        self.store.documents()
    }
}

/// Embed the content of every document, checking one vector comes back per input.
pub async fn embed_contents(docs: &[StoredDocument], embedder: &dyn Embedder) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
    let vectors = embedder.embed_documents(&texts).await?;
    ensure!(
        vectors.len() == docs.len(),
        "embedder returned {} vectors for {} documents",
        vectors.len(),
        docs.len()
    );
    Ok(vectors)
}
