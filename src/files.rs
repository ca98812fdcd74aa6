//! File classification and folder scanning.
//!
//! Decides which files are content (supported extension), which are
//! noise that is ignored without a trace (dotfiles, OS metadata, editor
//! backups and temp files), and which are reported as unsupported.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::config::IndexingConfig;
use crate::layout::path_key;

/// Extensions the document loader accepts (lower case, without the dot).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "pdf", "docx", "pptx", "xlsx", "xls", "csv"];

const SYSTEM_FILE_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];
const TEMP_EXTENSIONS: &[&str] = &["tmp", "temp"];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// True for hidden files, OS metadata, editor backups and temp files.
pub fn is_system_artifact(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with("~$") || name.ends_with('~') {
        return true;
    }
    if SYSTEM_FILE_NAMES.contains(&name.as_ref()) {
        return true;
    }
    matches!(extension(path), Some(ext) if TEMP_EXTENSIONS.contains(&ext.as_str()))
}

pub fn has_supported_extension(path: &Path) -> bool {
    matches!(extension(path), Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// A regular, non-artifact file with a supported extension.
pub fn is_indexable(path: &Path) -> bool {
    !is_system_artifact(path) && has_supported_extension(path) && path.is_file()
}

/// Lower-cased extension without the dot.
pub fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path_key(path))
}

/// Modification time in seconds since the Unix epoch.
pub fn modified_secs(metadata: &Metadata) -> f64 {
    metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn size_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Size ceiling check. Returns the size in MB when the file is too large.
pub fn oversized(path: &Path, max_file_size_mb: u64) -> Option<f64> {
    let bytes = std::fs::metadata(path).ok()?.len();
    let mb = size_mb(bytes);
    (mb > max_file_size_mb as f64).then_some(mb)
}

/// A file found while scanning a folder.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Normalized path string; the `source` of every chunk from this file.
    pub key: String,
    pub name: String,
    pub modified: f64,
    pub size_bytes: u64,
}

impl FileEntry {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            key: path_key(path),
            name: file_name(path),
            modified: modified_secs(&metadata),
            size_bytes: metadata.len(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// Files with a supported extension, in walk order.
    pub candidates: Vec<FileEntry>,
    /// Regular files with any other extension.
    pub unsupported: Vec<FileEntry>,
}

impl ScanResult {
    pub fn total(&self) -> usize {
        self.candidates.len() + self.unsupported.len()
    }
}

/// Path rules shared by full scans and watch batches, so both agree on
/// which files belong to a folder's index.
///
/// A path is excluded when any component below the folder starts with `.`,
/// when its folder-relative path matches an `exclude_globs` pattern, or when
/// it lies inside the storage root. Paths outside the folder are excluded.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    globs: GlobSet,
    storage_root: Option<PathBuf>,
}

impl PathFilter {
    pub fn new(root: &Path, indexing: &IndexingConfig) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            globs: build_globset(&indexing.exclude_globs)?,
            storage_root: None,
        })
    }

    /// Also exclude `storage_root` when it sits strictly inside the folder.
    pub fn with_storage_root(mut self, storage_root: &Path) -> Self {
        if storage_root != self.root && storage_root.starts_with(&self.root) {
            self.storage_root = Some(storage_root.to_path_buf());
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if let Some(storage) = &self.storage_root {
            if path.starts_with(storage) {
                return true;
            }
        }
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        let hidden = relative
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with('.')));
        hidden || self.globs.is_match(relative)
    }
}

/// Walk the filter's folder once in file-name order, classifying every
/// regular file.
///
/// Excluded directories are not entered. Unreadable entries are logged and
/// skipped.
pub fn scan_folder(filter: &PathFilter, follow_symlinks: bool) -> Result<ScanResult> {
    let root = filter.root();
    let mut result = ScanResult::default();

    let walker = WalkDir::new(root)
        .follow_links(follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && filter.is_excluded(e.path())));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if filter.is_excluded(path) || is_system_artifact(path) {
            continue;
        }

        let file = match FileEntry::from_path(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot stat file");
                continue;
            }
        };

        if has_supported_extension(path) {
            result.candidates.push(file);
        } else {
            result.unsupported.push(file);
        }
    }

    Ok(result)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
