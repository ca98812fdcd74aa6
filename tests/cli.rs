//! End-to-end tests of the `findme` binary.
//!
//! The embedding provider is disabled, so these cover everything that does
//! not need vectors: empty builds, failures, limits and maintenance.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn findme_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("findme");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("files")).unwrap();

    let config_content = format!(
        r#"[storage]
root = "{}/storage"

[embedding]
provider = "disabled"

[watch]
restore_on_start = false

[server]
bind = "127.0.0.1:0"
"#,
        root.display()
    );

    let config_path = config_dir.join("findme.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_findme(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = findme_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run findme binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(tmp: &TempDir) -> String {
    tmp.path().join("files").to_string_lossy().into_owned()
}

#[test]
fn test_index_empty_folder_reports_no_files() {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_findme(&config_path, &["index", &files_dir(&tmp), "--progress", "off"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("no files found"), "stdout: {}", stdout);
    assert!(stdout.contains("succeeded: 0"));

    let (stdout, _, success) = run_findme(&config_path, &["status", &files_dir(&tmp)]);
    assert!(success);
    assert!(stdout.contains("index: missing"));
}

#[test]
fn test_index_without_embeddings_fails() {
    let (tmp, config_path) = setup_test_env();
    fs::write(tmp.path().join("files").join("notes.txt"), "some notes").unwrap();

    let (stdout, stderr, success) = run_findme(&config_path, &["index", &files_dir(&tmp), "--progress", "json"]);
    assert!(!success, "index should fail without an embedder: {}", stdout);
    assert!(stderr.contains("no files indexed"), "stderr: {}", stderr);
    assert!(stderr.contains("\"event\":\"progress\""), "stderr: {}", stderr);
}

#[test]
fn test_index_missing_folder_fails() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("nowhere");
    let (_, stderr, success) = run_findme(&config_path, &["index", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("folder does not exist"), "stderr: {}", stderr);
}

#[test]
fn test_search_without_index_fails() {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_findme(&config_path, &["search", "anything", "--folder", &files_dir(&tmp)]);
    assert!(!success);
    assert!(stderr.contains("no index exists"), "stderr: {}", stderr);
}

#[test]
fn test_config_set_is_validated_and_persisted() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_findme(&config_path, &["config", "show"]);
    assert!(success);
    assert!(stdout.contains("\"max_text_length\": 20000"), "stdout: {}", stdout);

    let (_, stderr, success) = run_findme(
        &config_path,
        &["config", "set", "--max-text-length", "5000", "--max-file-size-mb", "9"],
    );
    assert!(!success);
    assert!(stderr.contains("max_file_size_mb must be between 10 and 500"), "stderr: {}", stderr);
    assert!(!tmp.path().join("storage").join("app_config.json").exists());

    let (stdout, stderr, success) = run_findme(&config_path, &["config", "set", "--max-text-length", "5000"]);
    assert!(success, "config set failed: {}", stderr);
    assert!(stdout.contains("\"max_text_length\": 5000"));

    let (stdout, _, _) = run_findme(&config_path, &["config", "show"]);
    assert!(stdout.contains("\"max_text_length\": 5000"));
}

#[test]
fn test_clean_and_status_on_fresh_storage() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_findme(&config_path, &["clean"]);
    assert!(success);
    assert!(stdout.contains("removed 0 index(es)"));

    let (stdout, _, success) = run_findme(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("monitored folders: 0"));
}

#[test]
fn test_help_lists_commands() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_findme(&config_path, &["--help"]);
    assert!(success);
    for cmd in ["index", "search", "watch", "status", "clean", "config", "serve"] {
        assert!(stdout.contains(cmd), "help is missing {}: {}", cmd, stdout);
    }
}
