//! Build status shared between a running build and its observers.
//!
//! A [`StatusHandle`] is cloned into the build task and into every caller
//! that polls progress. [`StatusHandle::try_begin`] is the only way to
//! start a build: it atomically checks `in_progress`, resets the status and
//! returns a [`BuildGuard`] that clears `in_progress` when dropped, even if
//! the build task returns early or panics.

use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Upper bound of the file-loading phase on the progress bar.
pub const LOADING_END: u8 = 50;
/// Upper bound of the vectorization phase.
pub const VECTORIZING_END: u8 = 90;
pub const DONE: u8 = 100;

/// Progress for `processed` of `total` files loaded (0–50).
pub fn loading_progress(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return LOADING_END;
    }
    ((processed.min(total) * LOADING_END as usize) / total) as u8
}

/// Progress for `done` of `total` embedding batches of the final flush (50–90).
pub fn vectorizing_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return VECTORIZING_END;
    }
    let span = (VECTORIZING_END - LOADING_END) as usize;
    LOADING_END + ((done.min(total) * span) / total) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    #[default]
    Idle,
    Preparing,
    Scanning,
    LoadingFiles,
    Vectorizing,
    Persisting,
    Completed,
    Failed,
}

impl BuildPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Completed | BuildPhase::Failed)
    }
}

/// Outcome recorded for one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Success without work: indexed earlier and unchanged since.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl FileOutcome {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            reason: None,
            skipped: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn unchanged(mut self) -> Self {
        self.skipped = true;
        self.reason = Some("already indexed and unchanged".to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileStats {
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStatus {
    pub in_progress: bool,
    /// 0–100, never decreasing within one build.
    pub progress: u8,
    pub status: String,
    pub completed: bool,
    pub error: Option<String>,
    pub phase: BuildPhase,
    pub folder: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub file_stats: FileStats,
    pub success_files: Vec<FileOutcome>,
    pub failed_files: Vec<FileOutcome>,
    pub skipped_files: Vec<FileOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<RwLock<IndexStatus>>);

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexStatus> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexStatus> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> IndexStatus {
        self.read().clone()
    }

    pub fn in_progress(&self) -> bool {
        self.read().in_progress
    }

    /// Claim the build slot for `folder`.
    ///
    /// Returns `None` when another build holds it. On success the status is
    /// reset and `in_progress` stays set until the guard is dropped.
    pub fn try_begin(&self, folder: &str) -> Option<BuildGuard> {
        let mut status = self.write();
        if status.in_progress {
            return None;
        }
        *status = IndexStatus {
            in_progress: true,
            status: "preparing index...".to_string(),
            phase: BuildPhase::Preparing,
            folder: Some(folder.to_string()),
            started_at: Some(chrono::Utc::now().to_rfc3339()),
            ..IndexStatus::default()
        };
        Some(BuildGuard {
            status: self.clone(),
        })
    }

    pub fn set_phase(&self, phase: BuildPhase, message: impl Into<String>) {
        let mut status = self.write();
        status.phase = phase;
        status.status = message.into();
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.write().status = message.into();
    }

    /// Raise progress to `value`; lower values are ignored.
    pub fn set_progress(&self, value: u8) {
        let mut status = self.write();
        status.progress = status.progress.max(value.min(DONE));
    }

    pub fn set_total(&self, total: usize) {
        self.write().file_stats.total_count = total;
    }

    pub fn record_success(&self, outcome: FileOutcome) {
        let mut status = self.write();
        status.file_stats.success_count += 1;
        status.success_files.push(outcome);
    }

    pub fn record_failure(&self, outcome: FileOutcome) {
        let mut status = self.write();
        status.file_stats.failure_count += 1;
        status.failed_files.push(outcome);
    }

    pub fn record_skipped(&self, outcome: FileOutcome) {
        let mut status = self.write();
        status.file_stats.skipped_count += 1;
        status.skipped_files.push(outcome);
    }

    pub fn complete(&self, message: impl Into<String>) {
        let mut status = self.write();
        status.phase = BuildPhase::Completed;
        status.status = message.into();
        status.completed = true;
        status.progress = DONE;
        status.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn fail(&self, error: impl Into<String>) {
        let mut status = self.write();
        let error = error.into();
        status.phase = BuildPhase::Failed;
        status.status = format!("index build failed: {}", error);
        status.error = Some(error);
        status.completed = false;
        status.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// Holds the build slot; dropping it clears `in_progress`.
#[derive(Debug)]
pub struct BuildGuard {
    status: StatusHandle,
}

impl BuildGuard {
    pub fn status(&self) -> &StatusHandle {
        &self.status
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        let interrupted = !self.status.read().phase.is_terminal();
        if interrupted {
            self.status.fail("build interrupted");
        }
        self.status.write().in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_mapping() {
        assert_eq!(loading_progress(0, 10), 0);
        assert_eq!(loading_progress(5, 10), 25);
        assert_eq!(loading_progress(10, 10), 50);
        assert_eq!(loading_progress(0, 0), 50);
        assert_eq!(vectorizing_progress(0, 4), 50);
        assert_eq!(vectorizing_progress(2, 4), 70);
        assert_eq!(vectorizing_progress(4, 4), 90);
    }

    #[test]
    fn test_try_begin_is_exclusive() {
        let status = StatusHandle::new();
        let guard = status.try_begin("/a").unwrap();
        assert!(status.in_progress());
        assert!(status.try_begin("/b").is_none());
        status.complete("done");
        drop(guard);
        assert!(!status.in_progress());
        assert!(status.try_begin("/b").is_some());
    }

    #[test]
    fn test_begin_resets_previous_run() {
        let status = StatusHandle::new();
        {
            let _guard = status.try_begin("/a").unwrap();
            status.record_failure(FileOutcome::new("x", "/a/x").with_reason("boom"));
            status.set_progress(80);
            status.complete("done");
        }
        let _guard = status.try_begin("/a").unwrap();
        let snap = status.snapshot();
        assert_eq!(snap.progress, 0);
        assert!(snap.failed_files.is_empty());
        assert!(!snap.completed);
        assert_eq!(snap.phase, BuildPhase::Preparing);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let status = StatusHandle::new();
        status.set_progress(40);
        status.set_progress(30);
        assert_eq!(status.snapshot().progress, 40);
        status.set_progress(250);
        assert_eq!(status.snapshot().progress, 100);
    }

    #[test]
    fn test_dropped_guard_marks_unfinished_build_failed() {
        let status = StatusHandle::new();
        let guard = status.try_begin("/a").unwrap();
        drop(guard);
        let snap = status.snapshot();
        assert!(!snap.in_progress);
        assert_eq!(snap.phase, BuildPhase::Failed);
        assert_eq!(snap.error.as_deref(), Some("build interrupted"));
    }

    #[test]
    fn test_outcome_serialization_omits_defaults() {
        let json = serde_json::to_value(FileOutcome::new("a.txt", "/d/a.txt")).unwrap();
        assert!(json.get("reason").is_none());
        assert!(json.get("skipped").is_none());
        let json = serde_json::to_value(FileOutcome::new("a.txt", "/d/a.txt").unchanged()).unwrap();
        assert_eq!(json["skipped"], true);
    }
}
