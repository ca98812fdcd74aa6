//! Debounced coalescing of filesystem events.
//!
//! Raw notify events are reduced to [`FsChange`]s and accumulated in a
//! [`Coalescer`]. Every recorded change pushes the deadline out by the quiet
//! period; once the deadline passes with no new events, [`Coalescer::drain`]
//! turns everything accumulated into one [`ChangeBatch`].
//!
//! Classification happens at drain time, against the filesystem as it is
//! then, so a file created and deleted within one quiet period ends up as a
//! removal (a no-op if it was never indexed).

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

use crate::files::{is_indexable, is_system_artifact, oversized, PathFilter};

/// A filesystem change relevant to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
}

/// Reduce a notify event to index-relevant changes.
///
/// Access events are ignored. A rename reported with both paths becomes a
/// [`FsChange::Moved`]; rename halves reported separately become a removal
/// and a creation. Events of unknown kind are resolved by whether the path
/// still exists.
pub fn convert_event(event: &Event) -> Vec<FsChange> {
    let paths = &event.paths;
    match &event.kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Create(_) => paths.iter().cloned().map(FsChange::Created).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(FsChange::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => vec![FsChange::Moved {
            from: paths[0].clone(),
            to: paths[1].clone(),
        }],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(FsChange::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().cloned().map(FsChange::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any | EventKind::Other => {
            paths.iter().cloned().map(by_existence).collect()
        }
        EventKind::Modify(_) => paths.iter().cloned().map(FsChange::Modified).collect(),
    }
}

fn by_existence(path: PathBuf) -> FsChange {
    if path.exists() {
        FsChange::Modified(path)
    } else {
        FsChange::Removed(path)
    }
}

/// One drained set of changes. A path never appears in both sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub upsert: BTreeSet<PathBuf>,
    pub remove: BTreeSet<PathBuf>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.upsert.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upsert.len() + self.remove.len()
    }
}

/// Accumulates changes for one watched folder until it goes quiet.
#[derive(Debug)]
pub struct Coalescer {
    quiet_period: Duration,
    upsert: BTreeSet<PathBuf>,
    remove: BTreeSet<PathBuf>,
    last_event: Option<Instant>,
}

impl Coalescer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            upsert: BTreeSet::new(),
            remove: BTreeSet::new(),
            last_event: None,
        }
    }

    pub fn record(&mut self, change: FsChange) {
        self.record_at(change, Instant::now());
    }

    pub fn record_at(&mut self, change: FsChange, now: Instant) {
        match change {
            FsChange::Created(path) | FsChange::Modified(path) => {
                self.upsert.insert(path);
            }
            FsChange::Removed(path) => {
                self.remove.insert(path);
            }
            FsChange::Moved { from, to } => {
                self.remove.insert(from);
                self.upsert.insert(to);
            }
        }
        self.last_event = Some(now);
    }

    /// Number of distinct paths waiting.
    pub fn pending(&self) -> usize {
        self.upsert.len() + self.remove.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upsert.is_empty() && self.remove.is_empty()
    }

    /// When the pending changes should be drained, if there are any.
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_empty() {
            return None;
        }
        self.last_event.map(|last| last + self.quiet_period)
    }

    /// Keep everything pending and wait another full quiet period.
    pub fn defer(&mut self) {
        if !self.is_empty() {
            self.last_event = Some(Instant::now());
        }
    }

    /// Take everything accumulated as one classified batch.
    ///
    /// Upserts win over removals of the same path. Upserts are kept only for
    /// supported regular files at or under `max_file_size_mb`; upserted
    /// paths that no longer exist become removals. System artifacts and
    /// paths `filter` excludes are dropped from both sets, so a batch never
    /// names a file a full scan would skip.
    pub fn drain(&mut self, filter: &PathFilter, max_file_size_mb: u64) -> ChangeBatch {
        let upsert = std::mem::take(&mut self.upsert);
        let mut remove = std::mem::take(&mut self.remove);
        self.last_event = None;

        let mut batch = ChangeBatch::default();
        for path in upsert {
            remove.remove(&path);
            if is_system_artifact(&path) || filter.is_excluded(&path) {
                continue;
            }
            if !path.exists() {
                batch.remove.insert(path);
                continue;
            }
            if !is_indexable(&path) {
                continue;
            }
            if let Some(mb) = oversized(&path, max_file_size_mb) {
                tracing::warn!(
                    path = %path.display(),
                    size_mb = mb,
                    limit_mb = max_file_size_mb,
                    "file too large, not indexing"
                );
                continue;
            }
            batch.upsert.insert(path);
        }
        batch
            .remove
            .extend(remove.into_iter().filter(|p| !is_system_artifact(p) && !filter.is_excluded(p)));
        batch
    }
}

/// Map `path` from the watcher's view of the folder onto `folder`.
///
/// Some platforms report canonical paths (symlinks resolved) even when a
/// non-canonical path was watched.
pub fn rebase_path(path: &Path, canonical_root: &Path, folder: &Path) -> PathBuf {
    match path.strip_prefix(canonical_root) {
        Ok(rest) if canonical_root != folder => folder.join(rest),
        _ => path.to_path_buf(),
    }
}
