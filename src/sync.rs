//! Applying a coalesced [`ChangeBatch`] to a folder's persisted index.
//!
//! The caller holds the folder's writer lock for the whole call. When the
//! folder has no usable index yet, nothing is touched and
//! [`SyncOutcome::NeedsFullBuild`] tells the caller to run a full build.
//!
//! Paths the folder's [`PathFilter`](crate::files::PathFilter) excludes are
//! ignored, the same way a full scan skips them.

use std::collections::HashSet;
use std::path::PathBuf;

use findme_core::models::StoredDocument;

use crate::builder::{flush, load_file, BuildContext};
use crate::coalescer::ChangeBatch;
use crate::error::SyncError;
use crate::files::FileEntry;
use crate::index_store::FolderIndex;
use crate::layout::{path_key, INDEX_FILE};
use crate::purge::{purge_sources, stored_sources_under};

#[derive(Debug)]
pub enum SyncOutcome {
    Applied(SyncReport),
    /// No persisted index, or one that cannot be read with the current model.
    NeedsFullBuild,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Files loaded and embedded.
    pub upserted: usize,
    /// Files that could not be loaded.
    pub failed: usize,
    /// Chunks purged before re-adding.
    pub purged: usize,
    /// Changed files not re-added because their old vectors could not be
    /// purged. Their recorded modification time stays old, so the next sync
    /// or build retries them.
    pub held: usize,
    pub chunks_added: usize,
    pub chunks_dropped: usize,
    /// Documents in the index afterwards; 0 means the index was removed.
    pub documents: usize,
}

/// Apply `batch` to the index in `ctx.index_dir`.
pub async fn apply_batch(ctx: &BuildContext, batch: &ChangeBatch) -> Result<SyncOutcome, SyncError> {
    if !ctx.index_dir.join(INDEX_FILE).is_file() {
        return Ok(SyncOutcome::NeedsFullBuild);
    }
    let index = match FolderIndex::load_local(&ctx.index_dir, Some(ctx.embedder.model_name())) {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(error = %e, "cannot sync into existing index");
            return Ok(SyncOutcome::NeedsFullBuild);
        }
    };

    let filter = ctx.path_filter()?;
    let upserts: Vec<&PathBuf> = batch.upsert.iter().filter(|p| !filter.is_excluded(p)).collect();
    let removals: Vec<&PathBuf> = batch.remove.iter().filter(|p| !filter.is_excluded(p)).collect();
    let ignored = batch.len() - upserts.len() - removals.len();
    if ignored > 0 {
        tracing::debug!(ignored, "ignoring excluded paths in change batch");
    }

    let mut report = SyncReport::default();
    let upsert_keys: Vec<String> = upserts.iter().map(|p| path_key(p)).collect();
    let remove_keys: Vec<String> = removals.iter().map(|p| path_key(p)).collect();

    let mut stale: HashSet<String> = stored_sources_under(&index, &remove_keys);
    stale.extend(
        upsert_keys
            .iter()
            .filter(|key| index.sources().contains_key(key.as_str()))
            .cloned(),
    );

    let mut held: HashSet<String> = HashSet::new();
    let mut index = if stale.is_empty() {
        Some(index)
    } else {
        let outcome = purge_sources(index, &stale, &ctx.scratch_dir);
        report.purged = outcome.removed();
        if outcome.is_failed() {
            held = stale;
        }
        outcome.into_index()
    };

    let input_budget = ctx.embedder.max_input_chars();
    let mut pending: Vec<StoredDocument> = Vec::new();
    for path in upserts {
        if held.contains(&path_key(path)) {
            tracing::warn!(path = %path.display(), "old vectors still stored, not re-adding changed file");
            report.held += 1;
            continue;
        }
        let file = match FileEntry::from_path(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "changed file is no longer readable");
                report.failed += 1;
                continue;
            }
        };
        match load_file(ctx.loader.as_ref(), &file, &ctx.limits, &ctx.chunking, input_budget) {
            Ok(docs) => {
                report.upserted += 1;
                pending.extend(docs);
            }
            Err(e) => {
                tracing::warn!(file = %file.key, error = %e, "failed to load changed file");
                report.failed += 1;
            }
        }
    }

    let flushed = flush(&mut index, pending, ctx.embedder.as_ref(), ctx.batch_rows, |_, _| {}).await;
    report.chunks_added = flushed.added;
    report.chunks_dropped = flushed.dropped;

    match index {
        Some(index) if !index.is_empty() => {
            index.save_local(&ctx.index_dir)?;
            report.documents = index.len();
        }
        _ => {
            tracing::info!(folder = %path_key(&ctx.folder), "index is empty after sync, removing it");
            if let Err(e) = std::fs::remove_dir_all(&ctx.index_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
    }

    tracing::info!(
        folder = %path_key(&ctx.folder),
        upserted = report.upserted,
        removed = remove_keys.len(),
        purged = report.purged,
        added = report.chunks_added,
        "applied change batch"
    );
    Ok(SyncOutcome::Applied(report))
}
