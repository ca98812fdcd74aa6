//! Build progress reporting for the CLI.
//!
//! `findme index` polls the engine's build status and hands every change to
//! a [`BuildProgressReporter`]. Progress goes to **stderr** so stdout stays
//! parseable for scripts.

use std::io::Write;

use crate::status::{BuildPhase, IndexStatus};

/// One observed change in build status.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildProgressEvent {
    pub phase: BuildPhase,
    pub progress: u8,
    pub message: String,
    /// Files with an outcome so far.
    pub processed: u64,
    pub total: u64,
}

impl From<&IndexStatus> for BuildProgressEvent {
    fn from(status: &IndexStatus) -> Self {
        let stats = &status.file_stats;
        Self {
            phase: status.phase,
            progress: status.progress,
            message: status.status.clone(),
            processed: (stats.success_count + stats.failure_count + stats.skipped_count) as u64,
            total: stats.total_count as u64,
        }
    }
}

pub trait BuildProgressReporter: Send + Sync {
    fn report(&self, event: &BuildProgressEvent);
}

/// Human-friendly progress on stderr: "index  42%  loading_files  1,234 / 5,000 files  processing ...".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: &BuildProgressEvent) {
        let line = format!(
            "index {:>3}%  {:<13}  {} / {} files  {}\n",
            event.progress,
            phase_name(event.phase),
            format_number(event.processed),
            format_number(event.total),
            event.message
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: &BuildProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": event.phase,
            "progress": event.progress,
            "status": event.message,
            "processed": event.processed,
            "total": event.total,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: &BuildProgressEvent) {}
}

fn phase_name(phase: BuildPhase) -> &'static str {
    match phase {
        BuildPhase::Idle => "idle",
        BuildPhase::Preparing => "preparing",
        BuildPhase::Scanning => "scanning",
        BuildPhase::LoadingFiles => "loading_files",
        BuildPhase::Vectorizing => "vectorizing",
        BuildPhase::Persisting => "persisting",
        BuildPhase::Completed => "completed",
        BuildPhase::Failed => "failed",
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FileStats;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn event_counts_every_outcome() {
        let status = IndexStatus {
            progress: 30,
            phase: BuildPhase::LoadingFiles,
            status: "processing file 4/10: a.txt".into(),
            file_stats: FileStats {
                success_count: 2,
                failure_count: 1,
                skipped_count: 1,
                total_count: 10,
            },
            ..IndexStatus::default()
        };
        let event = BuildProgressEvent::from(&status);
        assert_eq!(event.processed, 4);
        assert_eq!(event.total, 10);
        assert_eq!(event.progress, 30);
    }
}
