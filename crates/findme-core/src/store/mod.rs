//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is append-only: there is no delete-by-key
//! operation. Logical deletion goes through
//! [`retain_subset`](VectorStore::retain_subset), which materializes a new
//! store holding only the documents a predicate keeps. Backends with a
//! native delete can implement it directly; callers do not change.
//!
//! Every store also maintains a per-source side index ([`SourceEntry`]) so
//! that incremental builds can decide which files are unchanged without
//! scanning all stored documents.

pub mod flat;

use std::collections::HashMap;

use anyhow::Result;

use crate::models::StoredDocument;

/// A stored document paired with its distance to a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub document: StoredDocument,
    /// Distance to the query; lower is closer.
    pub score: f32,
}

/// Per-source summary kept alongside the vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceEntry {
    /// Number of chunks stored for the source.
    pub chunks: usize,
    /// Latest modification time recorded for the source at index time.
    pub modified: f64,
}

/// Append-only nearest-neighbor index over [`StoredDocument`]s.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`add`](VectorStore::add) | Append documents with their vectors |
/// | [`search`](VectorStore::search) | K nearest neighbors by distance |
/// | [`documents`](VectorStore::documents) | Enumerate every stored document |
/// | [`sources`](VectorStore::sources) | Source path → [`SourceEntry`] |
/// | [`retain_subset`](VectorStore::retain_subset) | Materialize a filtered copy |
pub trait VectorStore: Send + Sync + Sized {
    /// Vector dimensionality accepted by this store.
    fn dims(&self) -> usize;

    /// Number of stored documents.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append documents; `vectors[i]` is the embedding of `docs[i]`.
    fn add(&mut self, docs: Vec<StoredDocument>, vectors: Vec<Vec<f32>>) -> Result<()>;

    /// Return up to `k` documents ordered by ascending distance to `query`.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>>;

    /// Every stored document, in insertion order.
    fn documents(&self) -> Box<dyn Iterator<Item = &StoredDocument> + '_>;

    /// Source path → summary of what is stored for it.
    fn sources(&self) -> &HashMap<String, SourceEntry>;

    /// Build a new store holding only the documents for which `keep` is true.
    ///
    /// Stored vectors are reused as-is; nothing is re-embedded.
    fn retain_subset(&self, keep: &dyn Fn(&StoredDocument) -> bool) -> Result<Self>;
}
