//! Incremental change batches and live folder watches.

mod common;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use findme::builder::{BuildContext, IndexBuilder};
use findme::coalescer::{ChangeBatch, Coalescer, FsChange};
use findme::index_store::FolderIndex;
use findme::layout::{normalize_path, path_key};
use findme::status::StatusHandle;
use findme::sync::{apply_batch, SyncOutcome};

const WATCH_TIMEOUT: Duration = Duration::from_secs(15);

fn context(env: &TestEnv) -> BuildContext {
    let folder = normalize_path(&env.docs).unwrap();
    let config = env.engine.config();
    BuildContext {
        index_dir: env.engine.layout().index_dir(&path_key(&folder)),
        folder,
        scratch_dir: env.engine.layout().root().to_path_buf(),
        storage_root: env.engine.layout().root().to_path_buf(),
        limits: env.engine.limits(),
        chunking: config.chunking.spec(),
        indexing: config.indexing.clone(),
        batch_rows: config.embedding.batch_rows,
        embedder: env.embedder.clone(),
        loader: env.loader.clone(),
        status: StatusHandle::new(),
    }
}

fn batch(upsert: &[&Path], remove: &[&Path]) -> ChangeBatch {
    let set = |paths: &[&Path]| paths.iter().map(|p| p.to_path_buf()).collect::<BTreeSet<PathBuf>>();
    ChangeBatch {
        upsert: set(upsert),
        remove: set(remove),
    }
}

fn stored_names(ctx: &BuildContext) -> Vec<String> {
    match FolderIndex::load_local(&ctx.index_dir, Some(MODEL)) {
        Ok(index) => {
            let mut names: Vec<String> = index
                .sources()
                .keys()
                .filter_map(|k| Path::new(k).file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

// ============ apply_batch ============

#[tokio::test]
async fn test_batch_without_index_needs_full_build() {
    let env = TestEnv::new();
    let path = env.write("a.txt", "first words");
    let ctx = context(&env);

    let outcome = apply_batch(&ctx, &batch(&[&path], &[])).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::NeedsFullBuild));
    assert_eq!(env.loader.total(), 0);
}

#[tokio::test]
async fn test_removed_file_disappears_from_index() {
    let env = TestEnv::new();
    env.write("keep.txt", "granite and basalt");
    let gone = env.write("gone.txt", "sandstone and shale");
    env.build().await.unwrap();
    let ctx = context(&env);
    assert_eq!(stored_names(&ctx), vec!["gone.txt", "keep.txt"]);

    std::fs::remove_file(&gone).unwrap();
    let outcome = apply_batch(&ctx, &batch(&[], &[&gone])).await.unwrap();
    let SyncOutcome::Applied(report) = outcome else {
        panic!("expected an applied batch");
    };
    assert_eq!(report.purged, 1);
    assert_eq!(report.upserted, 0);
    assert_eq!(stored_names(&ctx), vec!["keep.txt"]);

    // Removing it again changes nothing.
    let SyncOutcome::Applied(again) = apply_batch(&ctx, &batch(&[], &[&gone])).await.unwrap() else {
        panic!("expected an applied batch");
    };
    assert_eq!(again.purged, 0);
    assert_eq!(stored_names(&ctx), vec!["keep.txt"]);
}

#[tokio::test]
async fn test_upsert_replaces_changed_and_adds_new_files() {
    let env = TestEnv::new();
    let changed = env.write("changed.txt", "old wording about lanterns");
    env.build().await.unwrap();
    let ctx = context(&env);

    std::fs::write(&changed, "new wording about lighthouses").unwrap();
    let added = env.write("added.txt", "brand new file about harbors");
    let SyncOutcome::Applied(report) = apply_batch(&ctx, &batch(&[&changed, &added], &[])).await.unwrap() else {
        panic!("expected an applied batch");
    };
    assert_eq!(report.upserted, 2);
    assert_eq!(report.purged, 1);
    assert_eq!(report.documents, 2);

    let index = FolderIndex::load_local(&ctx.index_dir, Some(MODEL)).unwrap();
    let contents: Vec<&str> = index.documents().map(|d| d.content.as_str()).collect();
    assert!(contents.iter().any(|c| c.contains("lighthouses")));
    assert!(!contents.iter().any(|c| c.contains("lanterns")));
    assert_eq!(stored_names(&ctx), vec!["added.txt", "changed.txt"]);
}

#[tokio::test]
async fn test_removed_directory_purges_everything_below_it() {
    let env = TestEnv::new();
    env.write("top.txt", "top level");
    env.write("sub/one.txt", "nested one");
    env.write("sub/deeper/two.txt", "nested two");
    env.build().await.unwrap();
    let ctx = context(&env);
    assert_eq!(stored_names(&ctx).len(), 3);

    let sub = env.docs.join("sub");
    std::fs::remove_dir_all(&sub).unwrap();
    let SyncOutcome::Applied(report) = apply_batch(&ctx, &batch(&[], &[&sub])).await.unwrap() else {
        panic!("expected an applied batch");
    };
    assert_eq!(report.purged, 2);
    assert_eq!(stored_names(&ctx), vec!["top.txt"]);
}

#[tokio::test]
async fn test_removing_last_file_removes_index() {
    let env = TestEnv::new();
    let only = env.write("only.txt", "alone");
    env.build().await.unwrap();
    let ctx = context(&env);

    std::fs::remove_file(&only).unwrap();
    let SyncOutcome::Applied(report) = apply_batch(&ctx, &batch(&[], &[&only])).await.unwrap() else {
        panic!("expected an applied batch");
    };
    assert_eq!(report.documents, 0);
    assert!(!ctx.index_dir.exists());
    assert!(!env.engine.index_exists(&env.folder()).unwrap());
}

#[tokio::test]
async fn test_hidden_and_excluded_paths_stay_out_of_the_index() {
    let env = TestEnv::new();
    env.write("a.txt", "the only real document");
    env.build().await.unwrap();
    let ctx = context(&env);

    let dep = env.write("node_modules/dep.txt", "vendored package readme");
    let notes = env.write(".git/notes.txt", "commit notes");

    let mut coalescer = Coalescer::new(Duration::from_millis(10));
    coalescer.record(FsChange::Created(dep.clone()));
    coalescer.record(FsChange::Created(notes.clone()));
    let drained = coalescer.drain(&ctx.path_filter().unwrap(), 100);
    assert!(drained.is_empty(), "drained: {:?}", drained);

    // A batch naming them directly is filtered the same way.
    let SyncOutcome::Applied(report) = apply_batch(&ctx, &batch(&[&dep, &notes], &[])).await.unwrap() else {
        panic!("expected an applied batch");
    };
    assert_eq!(report.upserted, 0);
    assert_eq!(env.loader.loads_of(&dep), 0);
    assert_eq!(stored_names(&ctx), vec!["a.txt"]);

    // A full build agrees with the watch path.
    env.build().await.unwrap();
    assert_eq!(stored_names(&ctx), vec!["a.txt"]);
}

#[tokio::test]
async fn test_failed_purge_holds_back_changed_file() {
    let env = TestEnv::new();
    let changed = env.write("changed.txt", "old wording about lanterns");
    env.write("other.txt", "untouched notes about ropes");
    env.build().await.unwrap();

    // A regular file where purge scratch directories should go.
    let blocker = env.tmp.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let mut ctx = context(&env);
    ctx.scratch_dir = blocker;

    std::fs::write(&changed, "new wording about lighthouses").unwrap();
    touch_later(&changed, 30);
    let SyncOutcome::Applied(report) = apply_batch(&ctx, &batch(&[&changed], &[])).await.unwrap() else {
        panic!("expected an applied batch");
    };
    assert_eq!(report.held, 1);
    assert_eq!(report.upserted, 0);
    assert_eq!(report.purged, 0);

    let index = FolderIndex::load_local(&ctx.index_dir, Some(MODEL)).unwrap();
    let contents: Vec<&str> = index.documents().map(|d| d.content.as_str()).collect();
    assert_eq!(contents.len(), 2);
    assert!(contents.iter().any(|c| c.contains("lanterns")));
    assert!(!contents.iter().any(|c| c.contains("lighthouses")));

    // The old mtime is still recorded, so a working purge picks it up later.
    let SyncOutcome::Applied(retry) = apply_batch(&context(&env), &batch(&[&changed], &[])).await.unwrap() else {
        panic!("expected an applied batch");
    };
    assert_eq!(retry.purged, 1);
    assert_eq!(retry.upserted, 1);
    let index = FolderIndex::load_local(&ctx.index_dir, Some(MODEL)).unwrap();
    assert_eq!(index.len(), 2);
    assert!(index.documents().any(|d| d.content.contains("lighthouses")));
    assert!(!index.documents().any(|d| d.content.contains("lanterns")));
}

#[tokio::test]
async fn test_failed_purge_during_build_skips_changed_file() {
    let env = TestEnv::new();
    let changed = env.write("changed.txt", "old wording about lanterns");
    env.write("other.txt", "untouched notes about ropes");
    env.build().await.unwrap();

    let blocker = env.tmp.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let mut ctx = context(&env);
    ctx.scratch_dir = blocker;

    std::fs::write(&changed, "new wording about lighthouses").unwrap();
    touch_later(&changed, 30);
    let report = IndexBuilder::new(ctx.clone()).run().await.unwrap();
    assert_eq!(report.stats.skipped_count, 1);
    assert_eq!(report.chunks_added, 0);
    assert_eq!(env.loader.loads_of(&changed), 1);
    let status = ctx.status.snapshot();
    assert_eq!(status.skipped_files.len(), 1);
    assert_eq!(status.skipped_files[0].name, "changed.txt");

    let index = FolderIndex::load_local(&ctx.index_dir, Some(MODEL)).unwrap();
    assert_eq!(index.len(), 2);
    assert!(!index.documents().any(|d| d.content.contains("lighthouses")));

    let rebuilt = env.build().await.unwrap();
    assert_eq!(rebuilt.purged, 1);
    let index = FolderIndex::load_local(&ctx.index_dir, Some(MODEL)).unwrap();
    assert_eq!(index.len(), 2);
    assert!(index.documents().any(|d| d.content.contains("lighthouses")));
    assert!(!index.documents().any(|d| d.content.contains("lanterns")));
}

// ============ live watches ============

#[tokio::test]
async fn test_watch_applies_created_and_deleted_files() {
    let env = TestEnv::new();
    env.write("base.txt", "baseline content about orchards");
    env.build().await.unwrap();
    let ctx = context(&env);
    assert!(env.engine.start_watch(&env.folder()).await.unwrap());

    let fresh = env.write("fresh.txt", "freshly written notes about comets");
    let ctx_ref = &ctx;
    let appeared = eventually(WATCH_TIMEOUT, || async move {
        stored_names(ctx_ref).contains(&"fresh.txt".to_string())
    })
    .await;
    assert!(appeared, "created file was never indexed");

    let hits = env.engine.search("notes about comets", &env.folder()).await.unwrap();
    assert!(hits[0].source.ends_with("fresh.txt"));

    std::fs::remove_file(&fresh).unwrap();
    let vanished = eventually(WATCH_TIMEOUT, || async move {
        stored_names(ctx_ref) == vec!["base.txt".to_string()]
    })
    .await;
    assert!(vanished, "deleted file was never purged");

    assert!(env.engine.stop_watch(&env.folder()).await.unwrap());
}

#[tokio::test]
async fn test_watch_without_index_falls_back_to_full_build() {
    let env = TestEnv::new();
    assert!(env.engine.start_watch(&env.folder()).await.unwrap());

    env.write("first.txt", "the very first file");
    let engine = &env.engine;
    let folder = env.folder();
    let folder = folder.as_str();
    let built = eventually(WATCH_TIMEOUT, || async move { engine.index_exists(folder).unwrap() }).await;
    assert!(built, "no index was built for a watched folder");

    env.engine.stop_all_watches().await.unwrap();
}

#[tokio::test]
async fn test_watch_registry_start_stop_and_status() {
    let env = TestEnv::new();
    let folder = env.folder();

    assert!(env.engine.start_watch(&folder).await.unwrap());
    assert!(!env.engine.start_watch(&folder).await.unwrap());

    let status = env.engine.watch_status(Some(&folder)).await.unwrap();
    assert!(status.is_monitoring);
    assert_eq!(status.monitored_folders.len(), 1);

    let persisted = findme::watcher::load_watch_state(&env.engine.layout().watch_state_file());
    assert_eq!(persisted.len(), 1);

    assert!(env.engine.stop_watch(&folder).await.unwrap());
    assert!(!env.engine.stop_watch(&folder).await.unwrap());
    assert!(!env.engine.watch_status(Some(&folder)).await.unwrap().is_monitoring);
    assert!(findme::watcher::load_watch_state(&env.engine.layout().watch_state_file()).is_empty());
}

#[tokio::test]
async fn test_watches_are_restored_and_missing_folders_dropped() {
    let env = TestEnv::new();
    let doomed = env.tmp.path().join("doomed");
    std::fs::create_dir_all(&doomed).unwrap();

    env.engine.start_watch(&env.folder()).await.unwrap();
    env.engine.start_watch(&doomed.to_string_lossy()).await.unwrap();
    std::fs::remove_dir_all(&doomed).unwrap();

    let reopened = engine_with(test_config(&env.storage), Arc::new(HashEmbedder::new()), env.loader.clone());
    assert_eq!(reopened.restore_watches().await, 1);

    let status = reopened.watch_status(None).await.unwrap();
    assert_eq!(status.monitored_folders.len(), 1);
    let persisted = findme::watcher::load_watch_state(&reopened.layout().watch_state_file());
    assert_eq!(persisted.len(), 1);

    reopened.stop_all_watches().await.unwrap();
    env.engine.stop_all_watches().await.unwrap();
}
