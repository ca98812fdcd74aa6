//! Error taxonomy for index synchronization.
//!
//! Only [`Validation`](SyncError::Validation)-class errors and
//! [`AlreadyIndexing`](SyncError::AlreadyIndexing) reach an interactive
//! caller directly. Per-file and per-batch errors are recorded in the
//! build status and never abort a run; [`FatalBuild`](SyncError::FatalBuild)
//! is the one error that marks a build as failed.

use thiserror::Error;

use crate::extract::ExtractError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Validation(String),

    #[error("folder does not exist: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("an index build is already in progress")]
    AlreadyIndexing,

    #[error("no index exists for folder: {0}")]
    IndexNotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("embedding batch of {size} document(s) failed: {reason}")]
    EmbeddingBatch { size: usize, reason: String },

    #[error("failed to load index at {path}: {reason}")]
    StoreLoad { path: String, reason: String },

    #[error("purge of {source_path} failed: {reason}")]
    Purge { source_path: String, reason: String },

    #[error("{0}")]
    FatalBuild(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// True for errors caused by the request itself rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_) | SyncError::NotFound(_) | SyncError::NotADirectory(_)
        )
    }
}
