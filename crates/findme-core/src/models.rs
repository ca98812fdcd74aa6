//! Data models shared by the loader, the index and the query path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A slice of text extracted from one file, before chunking.
///
/// Loaders may return several segments per file (one per PDF page,
/// spreadsheet sheet, slide, ...). All segments carry the same `source`.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSegment {
    /// Normalized path of the file the text came from.
    pub source: String,
    pub text: String,
}

impl TextSegment {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }
}

/// Provenance attached to every stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Normalized absolute path of the source file.
    pub source: String,
    /// Final path component, kept for display.
    pub file_name: String,
    /// Source modification time (seconds since the Unix epoch) at index time.
    pub modified: f64,
    /// Position of this chunk within its source file.
    pub chunk_index: usize,
}

/// A chunk of text as held by a vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl StoredDocument {
    /// Create a document with a fresh UUID.
    pub fn new(content: impl Into<String>, metadata: DocumentMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            metadata,
        }
    }

    pub fn source(&self) -> &str {
        &self.metadata.source
    }
}
