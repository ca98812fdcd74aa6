//! Full index builds.
//!
//! A build walks one folder, loads every new or changed file, splits it into
//! chunks and embeds them into the folder's [`FolderIndex`]. The run is
//! driven as a sequence of phases published through the shared
//! [`StatusHandle`]:
//!
//! ```text
//! preparing → scanning → loading files ⇄ vectorizing (partial) → vectorizing → persisting → completed
//! ```
//!
//! # Incremental Behavior
//!
//! When a readable index already exists, sources that vanished from disk or
//! whose modification time moved past the recorded one are purged first.
//! Files still present with an unchanged modification time are counted as
//! successes without being read again.
//!
//! # Partial Flushes
//!
//! Chunks accumulate in memory until either `flush_chunk_threshold` chunks
//! are pending or `flush_file_interval` files have been processed. Each
//! flush embeds the pending chunks, appends them and saves the index as a
//! checkpoint, so an interrupted build keeps what it already embedded.
//!
//! # Batch Halving
//!
//! Chunks are embedded `batch_rows` at a time. A failing batch is split in
//! two (first half `⌊B/2⌋`) and each half retried; a single chunk that still
//! fails is dropped with a warning.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use findme_core::chunk::{split_text, truncate_to_budget, ChunkSpec};
use findme_core::embedding::Embedder;
use findme_core::models::{DocumentMetadata, StoredDocument};

use crate::config::IndexingConfig;
use crate::error::SyncError;
use crate::extract::{prepare_file_text, DocumentLoader, ExtractError};
use crate::files::{extension, scan_folder, size_mb, FileEntry, PathFilter};
use crate::index_store::{embed_contents, FolderIndex};
use crate::layout::{normalize_path, path_key, INDEX_FILE};
use crate::limits::Limits;
use crate::purge::purge_sources;
use crate::status::{
    loading_progress, vectorizing_progress, BuildPhase, FileOutcome, FileStats, StatusHandle, LOADING_END,
    VECTORIZING_END,
};

/// Smallest batch the halving strategy will retry.
const MIN_EMBED_BATCH: usize = 1;

/// Resolve a user-supplied folder path to its normalized absolute form.
///
/// # Errors
///
/// [`SyncError::Validation`] for an empty path, [`SyncError::NotFound`] and
/// [`SyncError::NotADirectory`] when the path does not name a directory.
pub fn resolve_folder(raw: &str) -> Result<PathBuf, SyncError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SyncError::Validation("folder path is required".to_string()));
    }
    let folder = normalize_path(Path::new(raw))?;
    if !folder.exists() {
        return Err(SyncError::NotFound(path_key(&folder)));
    }
    if !folder.is_dir() {
        return Err(SyncError::NotADirectory(path_key(&folder)));
    }
    Ok(folder)
}

/// Everything one build needs, captured when the build is started.
#[derive(Clone)]
pub struct BuildContext {
    /// Normalized folder being indexed.
    pub folder: PathBuf,
    /// Directory holding this folder's index file.
    pub index_dir: PathBuf,
    /// Where purge rebuilds stage their scratch copies.
    pub scratch_dir: PathBuf,
    /// Never scanned or indexed, even when it lies inside `folder`.
    pub storage_root: PathBuf,
    pub limits: Limits,
    pub chunking: ChunkSpec,
    pub indexing: IndexingConfig,
    pub batch_rows: usize,
    pub embedder: Arc<dyn Embedder>,
    pub loader: Arc<dyn DocumentLoader>,
    pub status: StatusHandle,
}

impl BuildContext {
    /// Which paths under the folder belong to its index.
    pub fn path_filter(&self) -> anyhow::Result<PathFilter> {
        Ok(PathFilter::new(&self.folder, &self.indexing)?.with_storage_root(&self.storage_root))
    }
}

/// Summary of a finished build.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildReport {
    pub folder: String,
    pub message: String,
    pub stats: FileStats,
    pub chunks_added: usize,
    pub chunks_dropped: usize,
    pub purged: usize,
    pub documents: usize,
}

/// Counts from embedding a set of pending chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub added: usize,
    pub dropped: usize,
}

impl std::ops::AddAssign for FlushStats {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.dropped += other.dropped;
    }
}

/// Turn one file into embeddable chunks.
///
/// The text is capped at `max_text_length`, split, capped at
/// `max_chunk_count` chunks, and each chunk trimmed to the embedder's input
/// budget.
pub(crate) fn load_file(
    loader: &dyn DocumentLoader,
    file: &FileEntry,
    limits: &Limits,
    spec: &ChunkSpec,
    input_budget: usize,
) -> Result<Vec<StoredDocument>, SyncError> {
    let segments = loader.load(&file.path)?;
    let text = prepare_file_text(&file.name, &segments, limits.max_text_length)
        .ok_or(SyncError::Extraction(ExtractError::NoText))?;

    let mut chunks = split_text(&text, spec);
    if chunks.len() > limits.max_chunk_count {
        tracing::warn!(
            file = %file.key,
            chunks = chunks.len(),
            limit = limits.max_chunk_count,
            "too many chunks, keeping the first ones"
        );
        chunks.truncate(limits.max_chunk_count);
    }

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(chunk_index, chunk)| {
            StoredDocument::new(
                truncate_to_budget(&chunk, input_budget),
                DocumentMetadata {
                    source: file.key.clone(),
                    file_name: file.name.clone(),
                    modified: file.modified,
                    chunk_index,
                },
            )
        })
        .collect())
}

/// Embed `docs` into `index` in batches of `batch_rows`, halving failing
/// batches. Creates the index on the first successful batch.
///
/// `on_batch(done, total)` is called after each top-level batch.
pub(crate) async fn flush(
    index: &mut Option<FolderIndex>,
    docs: Vec<StoredDocument>,
    embedder: &dyn Embedder,
    batch_rows: usize,
    mut on_batch: impl FnMut(usize, usize),
) -> FlushStats {
    let mut stats = FlushStats::default();
    let batch_rows = batch_rows.max(MIN_EMBED_BATCH);

    let mut batches = Vec::new();
    let mut rest = docs;
    while !rest.is_empty() {
        let tail = rest.split_off(batch_rows.min(rest.len()));
        batches.push(rest);
        rest = tail;
    }
    let total = batches.len();

    for (done, batch) in batches.into_iter().enumerate() {
        let mut work = vec![batch];
        while let Some(batch) = work.pop() {
            let size = batch.len();
            match embed_contents(&batch, embedder).await {
                Ok(vectors) => match append(index, batch, vectors, embedder.model_name()) {
                    Ok(()) => stats.added += size,
                    Err(e) => {
                        tracing::warn!(size, error = %e, "embedded batch rejected by the index, dropping it");
                        stats.dropped += size;
                    }
                },
                Err(e) if size > MIN_EMBED_BATCH => {
                    let err = SyncError::EmbeddingBatch {
                        size,
                        reason: format!("{:#}", e),
                    };
                    tracing::warn!(error = %err, "halving batch");
                    let mut first = batch;
                    let second = first.split_off(size / 2);
                    work.push(second);
                    work.push(first);
                }
                Err(e) => {
                    let err = SyncError::EmbeddingBatch {
                        size,
                        reason: format!("{:#}", e),
                    };
                    let source = batch.first().map(|d| d.source().to_string()).unwrap_or_default();
                    tracing::warn!(error = %err, source = %source, "dropping chunk");
                    stats.dropped += size;
                }
            }
        }
        on_batch(done + 1, total);
    }
    stats
}

fn append(
    index: &mut Option<FolderIndex>,
    docs: Vec<StoredDocument>,
    vectors: Vec<Vec<f32>>,
    model: &str,
) -> anyhow::Result<()> {
    match index {
        Some(index) => index.add_vectors(docs, vectors),
        None => {
            *index = Some(FolderIndex::from_vectors(docs, vectors, model)?);
            Ok(())
        }
    }
}

/// A prior index after stale sources were purged.
struct Reconciled {
    index: Option<FolderIndex>,
    purged: usize,
    /// Stale sources whose purge failed. They must not be re-added.
    held: HashSet<String>,
}

/// Runs one full build of a folder.
pub struct IndexBuilder {
    ctx: BuildContext,
}

impl IndexBuilder {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    /// Run the build to completion and publish the terminal status.
    pub async fn run(self) -> Result<BuildReport, SyncError> {
        let status = self.ctx.status.clone();
        let result = self.build().await;
        match &result {
            Ok(report) => {
                tracing::info!(
                    folder = %report.folder,
                    added = report.chunks_added,
                    documents = report.documents,
                    "index build completed"
                );
                status.complete(report.message.clone());
            }
            Err(e) => {
                tracing::error!(folder = %path_key(&self.ctx.folder), error = %e, "index build failed");
                status.fail(e.to_string());
            }
        }
        result
    }

    async fn build(&self) -> Result<BuildReport, SyncError> {
        let ctx = &self.ctx;
        let status = &ctx.status;
        let folder_key = path_key(&ctx.folder);

        status.set_phase(BuildPhase::Preparing, "preparing index...");
        if !ctx.folder.is_dir() {
            return Err(SyncError::NotFound(folder_key));
        }
        std::fs::create_dir_all(&ctx.index_dir)?;

        status.set_phase(BuildPhase::Scanning, "scanning folder...");
        let scan = scan_folder(&ctx.path_filter()?, ctx.indexing.follow_symlinks)?;
        status.set_total(scan.total());
        for file in &scan.unsupported {
            let ext = extension(&file.path).unwrap_or_else(|| "(none)".to_string());
            status.record_failure(
                FileOutcome::new(&file.name, &file.key).with_reason(SyncError::UnsupportedFormat(ext).to_string()),
            );
        }
        tracing::info!(
            folder = %folder_key,
            candidates = scan.candidates.len(),
            unsupported = scan.unsupported.len(),
            "scanned folder"
        );

        let mut report = BuildReport {
            folder: folder_key.clone(),
            message: String::new(),
            stats: FileStats::default(),
            chunks_added: 0,
            chunks_dropped: 0,
            purged: 0,
            documents: 0,
        };

        let prior = self.load_prior();
        let had_prior = prior.is_some();
        let mut held: HashSet<String> = HashSet::new();
        let mut index = match prior {
            Some(existing) => {
                let reconciled = self.reconcile(existing, &scan.candidates);
                report.purged = reconciled.purged;
                held = reconciled.held;
                reconciled.index
            }
            None => None,
        };

        let recorded: HashMap<String, f64> = index
            .as_ref()
            .map(|i| i.sources().iter().map(|(k, e)| (k.clone(), e.modified)).collect())
            .unwrap_or_default();

        status.set_phase(BuildPhase::LoadingFiles, "loading files...");
        let total = scan.candidates.len();
        let input_budget = ctx.embedder.max_input_chars();
        let mut pending: Vec<StoredDocument> = Vec::new();
        let mut attempted = 0usize;
        let mut flushed = FlushStats::default();

        for (i, file) in scan.candidates.iter().enumerate() {
            status.set_progress(loading_progress(i, total));
            status.set_message(format!("processing file {}/{}: {}", i + 1, total, file.name));

            if matches!(recorded.get(&file.key), Some(&m) if file.modified <= m) {
                status.record_success(FileOutcome::new(&file.name, &file.key).unchanged());
                continue;
            }

            if held.contains(&file.key) {
                status.record_skipped(
                    FileOutcome::new(&file.name, &file.key)
                        .with_reason("previous vectors could not be removed, retrying on the next build"),
                );
                continue;
            }

            let mb = size_mb(file.size_bytes);
            if mb > ctx.limits.max_file_size_mb as f64 {
                status.record_skipped(FileOutcome::new(&file.name, &file.key).with_reason(format!(
                    "file too large: {:.2} MB (limit {} MB)",
                    mb, ctx.limits.max_file_size_mb
                )));
                continue;
            }

            attempted += 1;
            match load_file(ctx.loader.as_ref(), file, &ctx.limits, &ctx.chunking, input_budget) {
                Ok(docs) => {
                    tracing::debug!(file = %file.key, chunks = docs.len(), "loaded file");
                    pending.extend(docs);
                    status.record_success(FileOutcome::new(&file.name, &file.key));
                }
                Err(e) => {
                    tracing::warn!(file = %file.key, error = %e, "failed to load file");
                    status.record_failure(FileOutcome::new(&file.name, &file.key).with_reason(e.to_string()));
                }
            }

            let files_done = i + 1;
            let due = pending.len() >= ctx.indexing.flush_chunk_threshold
                || (ctx.indexing.flush_file_interval > 0 && files_done % ctx.indexing.flush_file_interval == 0);
            if due && !pending.is_empty() && files_done < total {
                status.set_phase(
                    BuildPhase::Vectorizing,
                    format!("vectorizing {} chunks (partial)...", pending.len()),
                );
                let docs = std::mem::take(&mut pending);
                flushed += flush(&mut index, docs, ctx.embedder.as_ref(), ctx.batch_rows, |_, _| {}).await;
                self.checkpoint(index.as_ref());
                status.set_phase(BuildPhase::LoadingFiles, "loading files...");
            }
        }
        status.set_progress(LOADING_END);

        if !pending.is_empty() {
            status.set_phase(
                BuildPhase::Vectorizing,
                format!("vectorizing {} chunks...", pending.len()),
            );
            let docs = std::mem::take(&mut pending);
            flushed += flush(&mut index, docs, ctx.embedder.as_ref(), ctx.batch_rows, |done, total| {
                status.set_progress(vectorizing_progress(done, total));
            })
            .await;
        }
        status.set_progress(VECTORIZING_END);
        report.chunks_added = flushed.added;
        report.chunks_dropped = flushed.dropped;

        let Some(index) = index else {
            if had_prior {
                tracing::info!(folder = %folder_key, "every stored source was stale, removing index");
            }
            self.remove_index_dir();
            if attempted == 0 {
                report.stats = status.snapshot().file_stats;
                report.message = "no files found".to_string();
                return Ok(report);
            }
            return Err(SyncError::FatalBuild("no files indexed".to_string()));
        };

        status.set_phase(BuildPhase::Persisting, "saving index...");
        index
            .save_local(&ctx.index_dir)
            .map_err(|e| SyncError::FatalBuild(format!("failed to save index: {}", e)))?;

        let stats = status.snapshot().file_stats;
        report.message = format!(
            "index built: {} succeeded, {} failed, {} skipped",
            stats.success_count, stats.failure_count, stats.skipped_count
        );
        report.stats = stats;
        report.documents = index.len();
        Ok(report)
    }

    /// The persisted index, if one exists and was built with the current
    /// model. An unreadable index is deleted so the build starts clean.
    fn load_prior(&self) -> Option<FolderIndex> {
        let ctx = &self.ctx;
        if !ctx.index_dir.join(INDEX_FILE).is_file() {
            return None;
        }
        match FolderIndex::load_local(&ctx.index_dir, Some(ctx.embedder.model_name())) {
            Ok(index) => {
                tracing::info!(documents = index.len(), "loaded existing index");
                Some(index)
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding existing index, rebuilding from scratch");
                self.remove_index_dir();
                if let Err(e) = std::fs::create_dir_all(&ctx.index_dir) {
                    tracing::warn!(error = %e, "cannot recreate index directory");
                }
                None
            }
        }
    }

    /// Purge sources that vanished or changed since they were indexed.
    fn reconcile(&self, index: FolderIndex, candidates: &[FileEntry]) -> Reconciled {
        let on_disk: HashMap<&str, f64> = candidates.iter().map(|f| (f.key.as_str(), f.modified)).collect();
        let stale: HashSet<String> = index
            .sources()
            .iter()
            .filter(|(source, entry)| match on_disk.get(source.as_str()) {
                None => true,
                Some(&modified) => modified > entry.modified,
            })
            .map(|(source, _)| source.clone())
            .collect();

        if stale.is_empty() {
            return Reconciled {
                index: Some(index),
                purged: 0,
                held: HashSet::new(),
            };
        }
        self.ctx
            .status
            .set_message(format!("removing {} stale source(s)...", stale.len()));
        let outcome = purge_sources(index, &stale, &self.ctx.scratch_dir);
        Reconciled {
            purged: outcome.removed(),
            held: if outcome.is_failed() { stale } else { HashSet::new() },
            index: outcome.into_index(),
        }
    }

    fn checkpoint(&self, index: Option<&FolderIndex>) {
        let Some(index) = index else {
            return;
        };
        match index.save_local(&self.ctx.index_dir) {
            Ok(()) => tracing::debug!(documents = index.len(), "saved checkpoint"),
            Err(e) => tracing::warn!(error = %e, "checkpoint save failed"),
        }
    }

    fn remove_index_dir(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.ctx.index_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.ctx.index_dir.display(), error = %e, "cannot remove index directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails any batch larger than `max_ok`, and any batch containing "poison".
    struct PickyEmbedder {
        max_ok: usize,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Embedder for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }

        fn max_input_chars(&self) -> usize {
            1000
        }

        async fn embed_documents(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.len());
            if texts.len() > self.max_ok {
                anyhow::bail!("batch too large");
            }
            if texts.iter().any(|t| t.contains("poison")) {
                anyhow::bail!("bad input");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn docs(contents: &[&str]) -> Vec<StoredDocument> {
        contents
            .iter()
            .enumerate()
            .map(|(i, c)| {
                StoredDocument::new(
                    *c,
                    DocumentMetadata {
                        source: format!("/d/{}.txt", i),
                        file_name: format!("{}.txt", i),
                        modified: 1.0,
                        chunk_index: 0,
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_flush_halves_until_batches_fit() {
        let embedder = PickyEmbedder {
            max_ok: 2,
            calls: Mutex::new(Vec::new()),
        };
        let mut index = None;
        let stats = flush(&mut index, docs(&["a", "b", "c", "d", "e"]), &embedder, 5, |_, _| {}).await;
        assert_eq!(stats, FlushStats { added: 5, dropped: 0 });
        assert_eq!(index.unwrap().len(), 5);
        // 5 fails, then 2 succeeds, then 3 fails, then 1 and 2 succeed.
        assert_eq!(*embedder.calls.lock().unwrap(), vec![5, 2, 3, 1, 2]);
    }

    #[tokio::test]
    async fn test_flush_drops_single_failing_chunk() {
        let embedder = PickyEmbedder {
            max_ok: 10,
            calls: Mutex::new(Vec::new()),
        };
        let mut index = None;
        let stats = flush(&mut index, docs(&["a", "poison", "c"]), &embedder, 3, |_, _| {}).await;
        assert_eq!(stats, FlushStats { added: 2, dropped: 1 });
        let index = index.unwrap();
        assert!(index.documents().all(|d| d.content != "poison"));
    }

    #[tokio::test]
    async fn test_flush_reports_batches() {
        let embedder = PickyEmbedder {
            max_ok: 10,
            calls: Mutex::new(Vec::new()),
        };
        let mut index = None;
        let mut seen = Vec::new();
        flush(&mut index, docs(&["a", "b", "c"]), &embedder, 2, |done, total| {
            seen.push((done, total))
        })
        .await;
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_resolve_folder_errors() {
        assert!(matches!(resolve_folder("  "), Err(SyncError::Validation(_))));
        assert!(matches!(
            resolve_folder("/definitely/not/here/findme"),
            Err(SyncError::NotFound(_))
        ));
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            resolve_folder(file.to_str().unwrap()),
            Err(SyncError::NotADirectory(_))
        ));
        assert!(resolve_folder(tmp.path().to_str().unwrap()).is_ok());
    }
}
