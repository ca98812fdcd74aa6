//! Folder watches.
//!
//! Each watched folder gets a `notify` watcher feeding a tokio channel and
//! one actor task that owns a [`Coalescer`]. The actor `select!`s over
//! filesystem events, control commands and the coalescer's deadline; when
//! the deadline fires it drains one batch and hands it to a [`ChangeSink`].
//!
//! The set of watched folders is persisted to `monitoring_config.json` so
//! watches can be restored when the process starts again.

use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::coalescer::{convert_event, rebase_path, ChangeBatch, Coalescer, FsChange};
use crate::error::SyncError;
use crate::files::PathFilter;
use crate::layout::{path_key, write_atomic};

/// What happened to a batch handed to a [`ChangeSink`].
#[derive(Debug)]
pub enum Delivery {
    Applied,
    /// The batch could not be applied yet; it is queued again.
    Deferred(ChangeBatch),
    /// The receiving side is gone; the watch ends.
    Closed,
}

/// Receives drained change batches for a watched folder.
#[async_trait]
pub trait ChangeSink: Send + Sync + 'static {
    /// True while changes must not be applied (a full build is running).
    fn busy(&self) -> bool;

    fn max_file_size_mb(&self) -> u64;

    async fn apply(&self, folder: &Path, batch: ChangeBatch) -> Delivery;
}

enum WatchCommand {
    Shutdown,
}

/// A running watch. Dropping it without [`stop`](Self::stop) leaves the
/// actor to exit once the notify watcher is gone.
pub struct WatchHandle {
    folder: PathBuf,
    commands: mpsc::Sender<WatchCommand>,
    task: JoinHandle<()>,
    _watcher: RecommendedWatcher,
}

impl WatchHandle {
    /// Start watching `folder` recursively. Changes to paths `filter`
    /// excludes never reach the sink.
    pub fn spawn(
        folder: PathBuf,
        quiet_period: Duration,
        filter: PathFilter,
        sink: Arc<dyn ChangeSink>,
    ) -> Result<Self, SyncError> {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(4);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| SyncError::Other(anyhow::anyhow!("watcher init failed: {}", e)))?;
        watcher.watch(&folder, RecursiveMode::Recursive).map_err(|e| {
            SyncError::Other(anyhow::anyhow!("failed to watch {}: {}", folder.display(), e))
        })?;

        let canonical = std::fs::canonicalize(&folder).unwrap_or_else(|_| folder.clone());
        let task = tokio::spawn(run_actor(
            folder.clone(),
            canonical,
            Coalescer::new(quiet_period),
            filter,
            event_rx,
            command_rx,
            sink,
        ));

        tracing::info!(folder = %folder.display(), quiet_ms = quiet_period.as_millis() as u64, "watch started");
        Ok(Self {
            folder,
            commands: command_tx,
            task,
            _watcher: watcher,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the watch and wait for the actor, including any sync it is
    /// running, to finish.
    pub async fn stop(self) {
        let Self {
            folder,
            commands,
            task,
            _watcher,
        } = self;
        drop(_watcher);
        let _ = commands.send(WatchCommand::Shutdown).await;
        if let Err(e) = task.await {
            tracing::warn!(folder = %folder.display(), error = %e, "watch task ended abnormally");
        }
        tracing::info!(folder = %folder.display(), "watch stopped");
    }
}

async fn run_actor(
    folder: PathBuf,
    canonical: PathBuf,
    mut coalescer: Coalescer,
    filter: PathFilter,
    mut events: mpsc::Receiver<notify::Result<Event>>,
    mut commands: mpsc::Receiver<WatchCommand>,
    sink: Arc<dyn ChangeSink>,
) {
    loop {
        let deadline = coalescer.deadline();

        tokio::select! {
            Some(cmd) = commands.recv() => match cmd {
                WatchCommand::Shutdown => break,
            },
            Some(event) = events.recv() => match event {
                Ok(event) => {
                    for change in convert_event(&event) {
                        coalescer.record(rebase_change(change, &canonical, &folder));
                    }
                }
                Err(e) => tracing::warn!(folder = %folder.display(), error = %e, "watch error"),
            },
            () = async {
                if let Some(deadline) = deadline {
                    time::sleep_until(deadline).await;
                }
            }, if deadline.is_some() => {
                if sink.busy() {
                    tracing::debug!(pending = coalescer.pending(), "build in progress, deferring changes");
                    coalescer.defer();
                    continue;
                }
                let batch = coalescer.drain(&filter, sink.max_file_size_mb());
                if batch.is_empty() {
                    continue;
                }
                tracing::debug!(folder = %folder.display(), changes = batch.len(), "quiet period elapsed");
                match sink.apply(&folder, batch).await {
                    Delivery::Applied => {}
                    Delivery::Deferred(batch) => {
                        requeue(&mut coalescer, batch);
                        coalescer.defer();
                    }
                    Delivery::Closed => break,
                }
            }
            else => break,
        }
    }
}

fn rebase_change(change: FsChange, canonical: &Path, folder: &Path) -> FsChange {
    let rebase = |p: PathBuf| rebase_path(&p, canonical, folder);
    match change {
        FsChange::Created(p) => FsChange::Created(rebase(p)),
        FsChange::Modified(p) => FsChange::Modified(rebase(p)),
        FsChange::Removed(p) => FsChange::Removed(rebase(p)),
        FsChange::Moved { from, to } => FsChange::Moved {
            from: rebase(from),
            to: rebase(to),
        },
    }
}

fn requeue(coalescer: &mut Coalescer, batch: ChangeBatch) {
    for path in batch.remove {
        coalescer.record(FsChange::Removed(path));
    }
    for path in batch.upsert {
        coalescer.record(FsChange::Modified(path));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatchEntry {
    monitoring: bool,
}

/// Active watches keyed by normalized folder path.
pub struct WatchRegistry {
    state_file: PathBuf,
    handles: HashMap<String, WatchHandle>,
}

impl WatchRegistry {
    pub fn new(state_file: PathBuf) -> Self {
        Self {
            state_file,
            handles: HashMap::new(),
        }
    }

    pub fn contains(&self, folder_key: &str) -> bool {
        self.handles.get(folder_key).is_some_and(|h| h.is_running())
    }

    pub fn insert(&mut self, folder_key: String, handle: WatchHandle) -> Option<WatchHandle> {
        self.handles.insert(folder_key, handle)
    }

    pub fn remove(&mut self, folder_key: &str) -> Option<WatchHandle> {
        self.handles.remove(folder_key)
    }

    pub fn drain(&mut self) -> Vec<WatchHandle> {
        self.handles.drain().map(|(_, h)| h).collect()
    }

    /// Watched folders, sorted.
    pub fn folders(&self) -> Vec<String> {
        let mut folders: Vec<String> = self.handles.keys().cloned().collect();
        folders.sort();
        folders
    }

    /// Write the current set of folders to the state file.
    pub fn persist(&self) -> Result<(), SyncError> {
        let state: BTreeMap<String, WatchEntry> = self
            .handles
            .keys()
            .map(|k| (k.clone(), WatchEntry { monitoring: true }))
            .collect();
        let json = serde_json::to_vec_pretty(&state).map_err(anyhow::Error::from)?;
        write_atomic(&self.state_file, &json)?;
        Ok(())
    }

    /// Folders recorded as watched in the state file.
    pub fn persisted_folders(&self) -> Vec<PathBuf> {
        load_watch_state(&self.state_file)
    }
}

/// Folders marked as monitored in `path`. A missing or unreadable file
/// yields nothing.
pub fn load_watch_state(path: &Path) -> Vec<PathBuf> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str::<BTreeMap<String, WatchEntry>>(&content) {
        Ok(state) => state
            .into_iter()
            .filter(|(_, entry)| entry.monitoring)
            .map(|(folder, _)| PathBuf::from(folder))
            .collect(),
        Err(e) => {
            tracing::warn!(path = %path_key(path), error = %e, "cannot parse watch state");
            Vec::new()
        }
    }
}
