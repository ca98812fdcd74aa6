//! Logical deletion over the append-only vector store.
//!
//! The store cannot delete by metadata, so purging a source rebuilds the
//! index from every document that does not belong to it, reusing the stored
//! vectors. The rebuilt index is round-tripped through a scratch directory
//! before it replaces the original, so a store that cannot be saved and
//! read back never becomes the live one.
//!
//! A purge never fails its caller: on any error the original index comes
//! back as [`PurgeOutcome::Failed`] with the stale vectors still in it.
//! Callers must not re-add those sources in that case, or the old vectors
//! would look current and never be purged.

use std::collections::HashSet;
use std::path::Path;

use findme_core::models::StoredDocument;

use crate::error::SyncError;
use crate::index_store::FolderIndex;

#[derive(Debug)]
pub enum PurgeOutcome {
    /// No stored document matched.
    Untouched(FolderIndex),
    /// The rebuild failed; the original index is returned unchanged.
    Failed(FolderIndex),
    /// Matching documents were removed; the rest are in `index`.
    Purged { index: FolderIndex, removed: usize },
    /// Every stored document matched. The caller decides whether an empty
    /// index is kept or deleted.
    Emptied { removed: usize },
}

impl PurgeOutcome {
    /// The surviving index, if any documents remain.
    pub fn into_index(self) -> Option<FolderIndex> {
        match self {
            PurgeOutcome::Untouched(index) | PurgeOutcome::Failed(index) | PurgeOutcome::Purged { index, .. } => {
                Some(index)
            }
            PurgeOutcome::Emptied { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PurgeOutcome::Failed(_))
    }

    pub fn removed(&self) -> usize {
        match self {
            PurgeOutcome::Untouched(_) | PurgeOutcome::Failed(_) => 0,
            PurgeOutcome::Purged { removed, .. } | PurgeOutcome::Emptied { removed } => *removed,
        }
    }
}

/// Remove every chunk whose source is `source`.
pub fn purge(index: FolderIndex, source: &str, scratch_dir: &Path) -> PurgeOutcome {
    let sources = HashSet::from([source.to_string()]);
    purge_sources(index, &sources, scratch_dir)
}

/// Remove every chunk whose source is in `sources`, in a single pass.
pub fn purge_sources(index: FolderIndex, sources: &HashSet<String>, scratch_dir: &Path) -> PurgeOutcome {
    let removed: usize = sources
        .iter()
        .filter_map(|s| index.sources().get(s))
        .map(|entry| entry.chunks)
        .sum();

    if removed == 0 {
        return PurgeOutcome::Untouched(index);
    }
    if removed >= index.len() {
        tracing::info!(removed, "purge removes every stored document");
        return PurgeOutcome::Emptied { removed };
    }

    match rebuild_without(&index, sources, scratch_dir) {
        Ok(rebuilt) => {
            tracing::info!(removed, remaining = rebuilt.len(), "purged stale vectors");
            PurgeOutcome::Purged {
                index: rebuilt,
                removed,
            }
        }
        Err(e) => {
            let err = SyncError::Purge {
                source_path: sources.iter().cloned().collect::<Vec<_>>().join(", "),
                reason: e.to_string(),
            };
            tracing::warn!(error = %err, "keeping original index with stale vectors");
            PurgeOutcome::Failed(index)
        }
    }
}

fn rebuild_without(
    index: &FolderIndex,
    sources: &HashSet<String>,
    scratch_dir: &Path,
) -> Result<FolderIndex, SyncError> {
    let retained = index.retain(&|doc: &StoredDocument| !sources.contains(doc.source()))?;

    let tmp = scratch_dir.join(format!(".purge-{}", uuid::Uuid::new_v4()));
    let reloaded = retained
        .save_local(&tmp)
        .and_then(|_| FolderIndex::load_local(&tmp, Some(retained.model())));
    if let Err(e) = std::fs::remove_dir_all(&tmp) {
        tracing::debug!(path = %tmp.display(), error = %e, "could not remove purge scratch directory");
    }
    reloaded
}

/// Stored sources named by `paths`, including every source under a path
/// that was a directory.
pub fn stored_sources_under<'a, I>(index: &FolderIndex, paths: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut matched = HashSet::new();
    for path in paths {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        for source in index.sources().keys() {
            if source == path || source.starts_with(&prefix) {
                matched.insert(source.clone());
            }
        }
    }
    matched
}
