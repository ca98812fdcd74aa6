//! The request surface.
//!
//! [`Engine`] is a cheap-to-clone handle over everything a request needs:
//! configuration, tunable limits, the shared build status, active watches
//! and one writer lock per folder. The HTTP server and the CLI both call the
//! same methods.
//!
//! # Locking
//!
//! - Only one build runs per process; [`StatusHandle::try_begin`] rejects a
//!   second one with [`SyncError::AlreadyIndexing`].
//! - Builds and watch syncs for the same folder hold that folder's async
//!   writer lock while they modify the index.
//! - Queries take no lock: they read the last saved index file.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use findme_core::embedding::Embedder;
use findme_core::search::SearchHit;

use crate::builder::{resolve_folder, BuildContext, BuildReport, IndexBuilder};
use crate::coalescer::ChangeBatch;
use crate::config::Config;
use crate::embedding::{config_factory, EmbedderFactory};
use crate::error::SyncError;
use crate::extract::{DocumentLoader, FileLoader};
use crate::files::PathFilter;
use crate::layout::{normalize_path, path_key, Layout};
use crate::limits::{Limits, LimitsUpdate, LimitsView};
use crate::query;
use crate::status::{IndexStatus, StatusHandle};
use crate::sync::{apply_batch, SyncOutcome};
use crate::watcher::{ChangeSink, Delivery, WatchHandle, WatchRegistry};

/// A dispatched build. Awaiting it is optional; progress is also published
/// through [`Engine::status`].
pub struct BuildHandle {
    folder: String,
    task: JoinHandle<Result<BuildReport, SyncError>>,
}

impl BuildHandle {
    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the build to finish.
    pub async fn wait(self) -> Result<BuildReport, SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::FatalBuild(format!("build task aborted: {}", e))),
        }
    }
}

/// Watch state for one folder, or for all of them.
#[derive(Debug, Clone, Serialize)]
pub struct WatchStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub is_monitoring: bool,
    pub monitored_folders: Vec<String>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    layout: Layout,
    limits: RwLock<Limits>,
    status: StatusHandle,
    watches: tokio::sync::Mutex<WatchRegistry>,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    embedders: EmbedderFactory,
    loader: Arc<dyn DocumentLoader>,
}

impl Engine {
    /// Engine with the configured embedding provider and the file loader.
    pub fn new(config: Config) -> Result<Self, SyncError> {
        let factory = config_factory(config.embedding.clone());
        Self::with_parts(config, factory, Arc::new(FileLoader))
    }

    /// Engine with explicit embedder and loader implementations.
    pub fn with_parts(
        config: Config,
        embedders: EmbedderFactory,
        loader: Arc<dyn DocumentLoader>,
    ) -> Result<Self, SyncError> {
        let root = normalize_path(&config.storage.root)?;
        std::fs::create_dir_all(&root)?;
        let layout = Layout::new(root);
        let limits = Limits::load(&layout.limits_file());
        let watches = WatchRegistry::new(layout.watch_state_file());

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                layout,
                limits: RwLock::new(limits),
                status: StatusHandle::new(),
                watches: tokio::sync::Mutex::new(watches),
                writers: Mutex::new(HashMap::new()),
                embedders,
                loader,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    // ── index ──────────────────────────────────────────────────────────

    /// True when a saved index exists for `folder`. The folder itself need
    /// not exist any more.
    pub fn index_exists(&self, folder: &str) -> Result<bool, SyncError> {
        let folder = normalize_folder(folder)?;
        Ok(self.inner.layout.index_exists(&path_key(&folder)))
    }

    /// Validate `folder` and dispatch a full build in the background.
    ///
    /// # Errors
    ///
    /// Only precondition failures: invalid folder, an embedder that cannot
    /// be created, or [`SyncError::AlreadyIndexing`]. Everything that goes
    /// wrong during the build is reported through [`status`](Self::status)
    /// and the returned handle.
    pub fn start_index(&self, folder: &str) -> Result<BuildHandle, SyncError> {
        let folder = resolve_folder(folder)?;
        let key = path_key(&folder);
        let embedder = self.embedder()?;
        let guard = self.inner.status.try_begin(&key).ok_or(SyncError::AlreadyIndexing)?;

        let ctx = self.build_context(&folder, embedder);
        let writer = self.writer(&key);
        tracing::info!(folder = %key, "starting index build");

        let task = tokio::spawn(async move {
            let _guard = guard;
            let _held = writer.lock().await;
            IndexBuilder::new(ctx).run().await
        });
        Ok(BuildHandle { folder: key, task })
    }

    pub fn status(&self) -> IndexStatus {
        self.inner.status.snapshot()
    }

    // ── search ─────────────────────────────────────────────────────────

    pub async fn search(&self, query: &str, folder: &str) -> Result<Vec<SearchHit>, SyncError> {
        let folder = normalize_folder(folder)?;
        let index_dir = self.inner.layout.index_dir(&path_key(&folder));
        let embedder = self.embedder()?;
        query::search(&index_dir, &folder, embedder.as_ref(), query, &self.inner.config.search).await
    }

    // ── watches ────────────────────────────────────────────────────────

    /// Start watching `folder`. Returns `false` when it was already watched.
    pub async fn start_watch(&self, folder: &str) -> Result<bool, SyncError> {
        let folder = resolve_folder(folder)?;
        let key = path_key(&folder);
        let mut watches = self.inner.watches.lock().await;
        if watches.contains(&key) {
            return Ok(false);
        }

        let quiet = Duration::from_millis(self.inner.config.watch.quiet_period_ms);
        let filter =
            PathFilter::new(&folder, &self.inner.config.indexing)?.with_storage_root(self.inner.layout.root());
        let sink = Arc::new(EngineSink(Arc::downgrade(&self.inner)));
        let handle = WatchHandle::spawn(folder, quiet, filter, sink)?;
        if let Some(stale) = watches.insert(key, handle) {
            stale.stop().await;
        }
        watches.persist()?;
        Ok(true)
    }

    /// Stop watching `folder`. Returns `false` when it was not watched.
    pub async fn stop_watch(&self, folder: &str) -> Result<bool, SyncError> {
        let folder = normalize_folder(folder)?;
        let mut watches = self.inner.watches.lock().await;
        let Some(handle) = watches.remove(&path_key(&folder)) else {
            return Ok(false);
        };
        handle.stop().await;
        watches.persist()?;
        Ok(true)
    }

    pub async fn watch_status(&self, folder: Option<&str>) -> Result<WatchStatus, SyncError> {
        let watches = self.inner.watches.lock().await;
        let monitored_folders = watches.folders();
        match folder {
            Some(folder) => {
                let key = path_key(&normalize_folder(folder)?);
                Ok(WatchStatus {
                    is_monitoring: watches.contains(&key),
                    folder: Some(key),
                    monitored_folders,
                })
            }
            None => Ok(WatchStatus {
                folder: None,
                is_monitoring: !monitored_folders.is_empty(),
                monitored_folders,
            }),
        }
    }

    /// Stop every watch. Returns how many were running.
    pub async fn stop_all_watches(&self) -> Result<usize, SyncError> {
        let mut watches = self.inner.watches.lock().await;
        let handles = watches.drain();
        let count = handles.len();
        for handle in handles {
            handle.stop().await;
        }
        watches.persist()?;
        Ok(count)
    }

    /// Restart the watches recorded in `monitoring_config.json`.
    ///
    /// Folders that no longer exist are dropped from the record. Returns the
    /// number of watches started.
    pub async fn restore_watches(&self) -> usize {
        let folders = self.inner.watches.lock().await.persisted_folders();
        let mut started = 0;
        for folder in folders {
            match self.start_watch(&path_key(&folder)).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(folder = %folder.display(), error = %e, "cannot restore watch"),
            }
        }
        if let Err(e) = self.inner.watches.lock().await.persist() {
            tracing::warn!(error = %e, "cannot save watch state");
        }
        if started > 0 {
            tracing::info!(count = started, "restored watches");
        }
        started
    }

    // ── maintenance ────────────────────────────────────────────────────

    /// Delete every stored index and stop every watch. The limits file is
    /// kept. Returns the number of index directories removed.
    pub async fn purge_all(&self) -> Result<usize, SyncError> {
        if self.inner.status.in_progress() {
            return Err(SyncError::AlreadyIndexing);
        }
        self.stop_all_watches().await?;

        let mut removed = 0;
        for entry in self.inner.layout.index_entries()? {
            let result = if entry.is_dir() {
                std::fs::remove_dir_all(&entry)
            } else {
                std::fs::remove_file(&entry)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %entry.display(), error = %e, "cannot remove index entry"),
            }
        }
        tracing::info!(removed, "purged all indexes");
        Ok(removed)
    }

    pub fn limits(&self) -> Limits {
        self.inner
            .limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn limits_view(&self) -> LimitsView {
        LimitsView::from(&self.limits())
    }

    /// Validate and persist new limits. Nothing changes if any value is out
    /// of range.
    pub fn update_limits(&self, update: &LimitsUpdate) -> Result<Limits, SyncError> {
        if update.is_empty() {
            return Err(SyncError::Validation("no settings provided".to_string()));
        }
        let mut limits = self.inner.limits.write().unwrap_or_else(|e| e.into_inner());
        let next = limits.apply(update)?;
        next.save(&self.inner.layout.limits_file())?;
        tracing::info!(?next, "limits updated");
        *limits = next.clone();
        Ok(next)
    }

    // ── internals ──────────────────────────────────────────────────────

    fn embedder(&self) -> Result<Arc<dyn Embedder>, SyncError> {
        let model = self.limits().embedding_model;
        Ok((self.inner.embedders)(model)?)
    }

    fn writer(&self, folder_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self.inner.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.entry(folder_key.to_string()).or_default().clone()
    }

    fn build_context(&self, folder: &Path, embedder: Arc<dyn Embedder>) -> BuildContext {
        let config = &self.inner.config;
        BuildContext {
            folder: folder.to_path_buf(),
            index_dir: self.inner.layout.index_dir(&path_key(folder)),
            scratch_dir: self.inner.layout.root().to_path_buf(),
            storage_root: self.inner.layout.root().to_path_buf(),
            limits: self.limits(),
            chunking: config.chunking.spec(),
            indexing: config.indexing.clone(),
            batch_rows: config.embedding.batch_rows,
            embedder,
            loader: self.inner.loader.clone(),
            status: self.inner.status.clone(),
        }
    }

    /// Apply one batch from a watch, falling back to a full build when the
    /// folder has no usable index.
    async fn sync_changes(&self, folder: &Path, batch: ChangeBatch) -> Delivery {
        let key = path_key(folder);
        let embedder = match self.embedder() {
            Ok(embedder) => embedder,
            Err(e) => {
                tracing::warn!(folder = %key, error = %e, "cannot create embedder, dropping changes");
                return Delivery::Applied;
            }
        };
        let ctx = self.build_context(folder, embedder);

        let writer = self.writer(&key);
        let held = writer.lock().await;
        let outcome = apply_batch(&ctx, &batch).await;
        drop(held);

        match outcome {
            Ok(SyncOutcome::Applied(_)) => Delivery::Applied,
            Ok(SyncOutcome::NeedsFullBuild) => match self.start_index(&key) {
                Ok(_) => {
                    tracing::info!(folder = %key, "no usable index, started a full build");
                    Delivery::Applied
                }
                Err(SyncError::AlreadyIndexing) => Delivery::Deferred(batch),
                Err(e) => {
                    tracing::warn!(folder = %key, error = %e, "cannot start full build for changes");
                    Delivery::Applied
                }
            },
            Err(e) => {
                tracing::warn!(folder = %key, error = %e, "failed to apply changes");
                Delivery::Applied
            }
        }
    }
}

/// Validate and normalize a folder path without requiring it to exist.
fn normalize_folder(raw: &str) -> Result<PathBuf, SyncError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SyncError::Validation("folder path is required".to_string()));
    }
    Ok(normalize_path(Path::new(raw))?)
}

/// Routes watch batches back into the engine without keeping it alive.
struct EngineSink(Weak<EngineInner>);

impl EngineSink {
    fn engine(&self) -> Option<Engine> {
        self.0.upgrade().map(|inner| Engine { inner })
    }
}

#[async_trait]
impl ChangeSink for EngineSink {
    fn busy(&self) -> bool {
        self.0.upgrade().is_some_and(|inner| inner.status.in_progress())
    }

    fn max_file_size_mb(&self) -> u64 {
        self.engine()
            .map(|e| e.limits().max_file_size_mb)
            .unwrap_or_else(|| Limits::default().max_file_size_mb)
    }

    async fn apply(&self, folder: &Path, batch: ChangeBatch) -> Delivery {
        match self.engine() {
            Some(engine) => engine.sync_changes(folder, batch).await,
            None => Delivery::Closed,
        }
    }
}
