//! On-disk layout of the storage root.
//!
//! ```text
//! <root>/
//!   <sha256(folder)>/index.fidx   one index per watched folder
//!   monitoring_config.json        folders with an active watch
//!   app_config.json               tunable limits
//! ```
//!
//! Folders are addressed by the SHA-256 of their normalized path, so the
//! same folder always maps to the same index directory and a renamed
//! folder maps to a fresh one.

use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// File inside an index directory whose presence marks the index as existing.
pub const INDEX_FILE: &str = "index.fidx";
pub const WATCH_STATE_FILE: &str = "monitoring_config.json";
pub const LIMITS_FILE: &str = "app_config.json";

/// Make `path` absolute and resolve `.`/`..` lexically (symlinks are kept).
pub fn normalize_path(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// String form of a normalized path used as the identity of folders and
/// stored sources. Separators are always `/`.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so
/// readers see either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Index directory for a folder key (see [`path_key`]).
    pub fn index_dir(&self, folder_key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(folder_key.as_bytes());
        self.root.join(format!("{:x}", hasher.finalize()))
    }

    pub fn index_file(&self, folder_key: &str) -> PathBuf {
        self.index_dir(folder_key).join(INDEX_FILE)
    }

    /// An index exists when its directory holds the index artifact.
    pub fn index_exists(&self, folder_key: &str) -> bool {
        self.index_dir(folder_key).is_dir() && self.index_file(folder_key).is_file()
    }

    pub fn watch_state_file(&self) -> PathBuf {
        self.root.join(WATCH_STATE_FILE)
    }

    pub fn limits_file(&self) -> PathBuf {
        self.root.join(LIMITS_FILE)
    }

    /// Every entry under the root except the JSON state files.
    pub fn index_entries(&self) -> std::io::Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == WATCH_STATE_FILE || name == LIMITS_FILE {
                continue;
            }
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resolves_dots() {
        let p = normalize_path(Path::new("/data/./docs/../notes/")).unwrap();
        assert_eq!(path_key(&p), "/data/notes");
    }

    #[test]
    fn test_normalize_makes_relative_absolute() {
        let p = normalize_path(Path::new("some/dir")).unwrap();
        assert!(p.is_absolute());
        assert!(path_key(&p).ends_with("some/dir"));
    }

    #[test]
    fn test_index_dir_is_stable_and_distinct() {
        let layout = Layout::new("/store");
        assert_eq!(layout.index_dir("/a"), layout.index_dir("/a"));
        assert_ne!(layout.index_dir("/a"), layout.index_dir("/b"));
        let name = layout.index_dir("/a");
        let name = name.file_name().unwrap().to_string_lossy();
        assert_eq!(name.len(), 64);
    }

    #[test]
    fn test_index_exists_requires_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        assert!(!layout.index_exists("/folder"));
        std::fs::create_dir_all(layout.index_dir("/folder")).unwrap();
        assert!(!layout.index_exists("/folder"));
        std::fs::write(layout.index_file("/folder"), b"x").unwrap();
        assert!(layout.index_exists("/folder"));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_index_entries_skip_state_files() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        std::fs::write(layout.limits_file(), "{}").unwrap();
        std::fs::write(layout.watch_state_file(), "{}").unwrap();
        std::fs::create_dir_all(layout.index_dir("/x")).unwrap();
        let entries = layout.index_entries().unwrap();
        assert_eq!(entries, vec![layout.index_dir("/x")]);
    }
}
