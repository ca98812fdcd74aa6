//! Flat exact-L2 [`VectorStore`] implementation.
//!
//! Vectors live in one contiguous `Vec<f32>` (row-major, `dims` floats per
//! document). Search is brute-force squared Euclidean distance over every
//! row, which gives exact recall at the cost of O(N) per query.
//!
//! # Encoding
//!
//! [`FlatIndex::encode`] produces a single self-describing byte buffer:
//!
//! ```text
//! "FMIX" | version: u32 LE | manifest_len: u64 LE | manifest JSON | vector blob
//! ```
//!
//! The manifest records the embedding model, dimensionality and every
//! document; the blob is the little-endian f32 matrix from
//! [`vec_to_blob`](crate::embedding::vec_to_blob).

use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use super::{ScoredDocument, SourceEntry, VectorStore};
use crate::embedding::{blob_to_vec, l2_distance_squared, vec_to_blob};
use crate::models::StoredDocument;

const MAGIC: &[u8; 4] = b"FMIX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8;

/// In-memory flat index with exact nearest-neighbor search.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dims: usize,
    documents: Vec<StoredDocument>,
    vectors: Vec<f32>,
    sources: HashMap<String, SourceEntry>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: u32,
    model: String,
    dims: usize,
    documents: Vec<StoredDocument>,
}

impl FlatIndex {
    /// Create an empty index for vectors of `dims` dimensions.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            documents: Vec::new(),
            vectors: Vec::new(),
            sources: HashMap::new(),
        }
    }

    /// Create an index from documents and their vectors.
    ///
    /// The dimensionality is taken from the first vector.
    pub fn from_documents(docs: Vec<StoredDocument>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        let dims = match vectors.first() {
            Some(v) if !v.is_empty() => v.len(),
            _ => bail!("cannot build an index without at least one non-empty vector"),
        };
        let mut index = Self::new(dims);
        index.add(docs, vectors)?;
        Ok(index)
    }

    /// Serialize the index, tagging it with the embedding model that produced it.
    pub fn encode(&self, model: &str) -> Result<Vec<u8>> {
        let manifest = Manifest {
            version: FORMAT_VERSION,
            model: model.to_string(),
            dims: self.dims,
            documents: self.documents.clone(),
        };
        let json = serde_json::to_vec(&manifest).context("failed to encode index manifest")?;
        let blob = vec_to_blob(&self.vectors);

        let mut out = Vec::with_capacity(HEADER_LEN + json.len() + blob.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(json.len() as u64).to_le_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(&blob);
        Ok(out)
    }

    /// Parse bytes produced by [`encode`](Self::encode).
    ///
    /// Returns the index and the model name it was built with.
    pub fn decode(bytes: &[u8]) -> Result<(Self, String)> {
        ensure!(bytes.len() >= HEADER_LEN, "index data truncated: missing header");
        ensure!(&bytes[..4] == MAGIC, "not a findme index (bad magic)");

        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        ensure!(
            version == FORMAT_VERSION,
            "unsupported index format version {}",
            version
        );

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[8..HEADER_LEN]);
        let manifest_len = u64::from_le_bytes(len_bytes) as usize;
        let manifest_end = HEADER_LEN
            .checked_add(manifest_len)
            .filter(|&end| end <= bytes.len())
            .context("index data truncated: manifest")?;

        let manifest: Manifest = serde_json::from_slice(&bytes[HEADER_LEN..manifest_end])
            .context("failed to parse index manifest")?;
        let vectors = blob_to_vec(&bytes[manifest_end..]);

        ensure!(
            vectors.len() == manifest.documents.len() * manifest.dims,
            "index vector data does not match manifest ({} floats for {} documents × {} dims)",
            vectors.len(),
            manifest.documents.len(),
            manifest.dims
        );

        let mut index = Self::new(manifest.dims);
        for doc in &manifest.documents {
            index.record_source(doc);
        }
        index.documents = manifest.documents;
        index.vectors = vectors;
        Ok((index, manifest.model))
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dims..(i + 1) * self.dims]
    }

    fn record_source(&mut self, doc: &StoredDocument) {
        let entry = self
            .sources
            .entry(doc.metadata.source.clone())
            .or_insert(SourceEntry {
                chunks: 0,
                modified: doc.metadata.modified,
            });
        entry.chunks += 1;
        if doc.metadata.modified > entry.modified {
            entry.modified = doc.metadata.modified;
        }
    }
}

impl VectorStore for FlatIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        self.documents.len()
    }

    fn add(&mut self, docs: Vec<StoredDocument>, vectors: Vec<Vec<f32>>) -> Result<()> {
        ensure!(
            docs.len() == vectors.len(),
            "got {} vectors for {} documents",
            vectors.len(),
            docs.len()
        );
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            bail!(
                "vector has {} dimensions, index expects {}",
                bad.len(),
                self.dims
            );
        }

        self.vectors.reserve(vectors.len() * self.dims);
        for v in &vectors {
            self.vectors.extend_from_slice(v);
        }
        for doc in &docs {
            self.record_source(doc);
        }
        self.documents.extend(docs);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>> {
        ensure!(
            query.len() == self.dims,
            "query vector has {} dimensions, index expects {}",
            query.len(),
            self.dims
        );

        let mut scored: Vec<(usize, f32)> = (0..self.documents.len())
            .map(|i| (i, l2_distance_squared(query, self.row(i))))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredDocument {
                document: self.documents[i].clone(),
                score,
            })
            .collect())
    }

    fn documents(&self) -> Box<dyn Iterator<Item = &StoredDocument> + '_> {
        Box::new(self.documents.iter())
    }

    fn sources(&self) -> &HashMap<String, SourceEntry> {
        &self.sources
    }

    fn retain_subset(&self, keep: &dyn Fn(&StoredDocument) -> bool) -> Result<Self> {
        let mut subset = Self::new(self.dims);
        for (i, doc) in self.documents.iter().enumerate() {
            if keep(doc) {
                subset.vectors.extend_from_slice(self.row(i));
                subset.record_source(doc);
                subset.documents.push(doc.clone());
            }
        }
        Ok(subset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn doc(source: &str, content: &str, modified: f64) -> StoredDocument {
        StoredDocument::new(
            content,
            DocumentMetadata {
                source: source.to_string(),
                file_name: source.rsplit('/').next().unwrap_or(source).to_string(),
                modified,
                chunk_index: 0,
            },
        )
    }

    fn sample() -> FlatIndex {
        FlatIndex::from_documents(
            vec![
                doc("/a.txt", "alpha", 10.0),
                doc("/b.txt", "bravo", 20.0),
                doc("/a.txt", "alpha two", 15.0),
            ],
            vec![vec![0.0, 0.0], vec![10.0, 10.0], vec![1.0, 0.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = sample();
        let hits = index.search(&[0.9, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].document.content, "alpha two");
        assert_eq!(hits[1].document.content, "alpha");
        assert_eq!(hits[2].document.content, "bravo");
        assert!(hits[0].score <= hits[1].score && hits[1].score <= hits[2].score);
    }

    #[test]
    fn test_search_truncates_to_k() {
        let index = sample();
        assert_eq!(index.search(&[0.0, 0.0], 1).unwrap().len(), 1);
    }

    #[test]
    fn test_search_rejects_wrong_dims() {
        assert!(sample().search(&[0.0], 3).is_err());
    }

    #[test]
    fn test_add_rejects_mismatched_counts() {
        let mut index = FlatIndex::new(2);
        let err = index.add(vec![doc("/x", "x", 0.0)], vec![]);
        assert!(err.is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_add_rejects_wrong_dims() {
        let mut index = FlatIndex::new(2);
        assert!(index.add(vec![doc("/x", "x", 0.0)], vec![vec![1.0]]).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_source_index_tracks_chunks_and_latest_mtime() {
        let index = sample();
        let a = index.sources()["/a.txt"];
        assert_eq!(a.chunks, 2);
        assert_eq!(a.modified, 15.0);
        assert_eq!(index.sources()["/b.txt"].chunks, 1);
    }

    #[test]
    fn test_retain_subset_keeps_vectors_aligned() {
        let index = sample();
        let subset = index.retain_subset(&|d: &StoredDocument| d.source() != "/a.txt").unwrap();
        assert_eq!(subset.len(), 1);
        assert!(!subset.sources().contains_key("/a.txt"));
        let hits = subset.search(&[10.0, 10.0], 1).unwrap();
        assert_eq!(hits[0].document.content, "bravo");
        assert_eq!(hits[0].score, 0.0);
    }

    #[test]
    fn test_encode_decode_preserves_search() {
        let index = sample();
        let bytes = index.encode("text-embedding-v2").unwrap();
        let (restored, model) = FlatIndex::decode(&bytes).unwrap();
        assert_eq!(model, "text-embedding-v2");
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.sources()["/a.txt"].chunks, 2);
        let hits = restored.search(&[10.0, 10.0], 1).unwrap();
        assert_eq!(hits[0].document.content, "bravo");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(FlatIndex::decode(b"nope").is_err());
        assert!(FlatIndex::decode(b"XXXX\x01\0\0\0\0\0\0\0\0\0\0\0").is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_vectors() {
        let mut bytes = sample().encode("m").unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(FlatIndex::decode(&bytes).is_err());
    }
}
