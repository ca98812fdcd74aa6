//! Shared fixtures for the integration tests.
//!
//! The embedders here are deterministic and offline: [`HashEmbedder`]
//! hashes words into a fixed number of buckets so that texts sharing words
//! land close together, which is enough to make phrase searches rank the
//! right file first.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use findme::config::Config;
use findme::embedding::EmbedderFactory;
use findme::engine::Engine;
use findme::extract::{DocumentLoader, ExtractError, FileLoader};
use findme_core::embedding::Embedder;
use findme_core::models::TextSegment;

pub const MODEL: &str = "hash-bow";
const DIMS: usize = 1024;

/// Bag-of-words embedder over hashed, lowercased words.
#[derive(Default)]
pub struct HashEmbedder {
    calls: AtomicUsize,
    texts: AtomicUsize,
    /// Batches larger than this fail, when set.
    max_batch: Option<usize>,
    /// Any batch holding a text that contains this marker fails.
    poison: Option<String>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_above(max_batch: usize) -> Self {
        Self {
            max_batch: Some(max_batch),
            ..Self::default()
        }
    }

    pub fn poisoned_by(marker: &str) -> Self {
        Self {
            poison: Some(marker.to_string()),
            ..Self::default()
        }
    }

    /// Successful and failed `embed_documents` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts embedded successfully.
    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn max_input_chars(&self) -> usize {
        2048
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());
        if let Some(max) = self.max_batch {
            if texts.len() > max {
                bail!("batch of {} exceeds {}", texts.len(), max);
            }
        }
        if let Some(marker) = &self.poison {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                bail!("poisoned input");
            }
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

/// [`FileLoader`] that counts how often each file is loaded.
#[derive(Default)]
pub struct CountingLoader {
    loads: Mutex<HashMap<PathBuf, usize>>,
}

impl CountingLoader {
    pub fn total(&self) -> usize {
        self.loads.lock().unwrap().values().sum()
    }

    pub fn loads_of(&self, path: &Path) -> usize {
        let loads = self.loads.lock().unwrap();
        loads
            .iter()
            .filter(|(p, _)| p.file_name() == path.file_name())
            .map(|(_, n)| *n)
            .sum()
    }
}

impl DocumentLoader for CountingLoader {
    fn load(&self, path: &Path) -> Result<Vec<TextSegment>, ExtractError> {
        *self.loads.lock().unwrap().entry(path.to_path_buf()).or_default() += 1;
        FileLoader.load(path)
    }
}

/// A storage root, a documents folder and an engine wired to fakes.
pub struct TestEnv {
    pub tmp: TempDir,
    pub docs: PathBuf,
    pub storage: PathBuf,
    pub engine: Engine,
    pub embedder: Arc<HashEmbedder>,
    pub loader: Arc<CountingLoader>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_embedder(HashEmbedder::new(), |_| {})
    }

    pub fn with_embedder(embedder: HashEmbedder, tweak: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        let storage = tmp.path().join("storage");
        std::fs::create_dir_all(&docs).unwrap();

        let mut config = test_config(&storage);
        tweak(&mut config);

        let embedder = Arc::new(embedder);
        let loader = Arc::new(CountingLoader::default());
        let engine = engine_with(config, embedder.clone(), loader.clone());
        Self {
            tmp,
            docs,
            storage,
            engine,
            embedder,
            loader,
        }
    }

    pub fn folder(&self) -> String {
        self.docs.to_string_lossy().into_owned()
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.docs.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Run a full build to completion.
    pub async fn build(&self) -> Result<findme::builder::BuildReport, findme::SyncError> {
        self.engine.start_index(&self.folder())?.wait().await
    }
}

pub fn test_config(storage: &Path) -> Config {
    let mut config = Config::default();
    config.storage.root = storage.to_path_buf();
    config.embedding.provider = "disabled".to_string();
    config.watch.quiet_period_ms = 200;
    config.watch.restore_on_start = false;
    config
}

pub fn engine_with(config: Config, embedder: Arc<HashEmbedder>, loader: Arc<dyn DocumentLoader>) -> Engine {
    let factory: EmbedderFactory = Arc::new(move |_model| Ok(embedder.clone() as Arc<dyn Embedder>));
    Engine::with_parts(config, factory, loader).unwrap()
}

/// Push a file's modification time into the future so it reads as changed.
pub fn touch_later(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs)).unwrap();
}

/// Text of non-repeating words prefixed by `seed`, at least `len` bytes long.
pub fn filler(seed: &str, len: usize) -> String {
    let mut out = String::with_capacity(len + 64);
    let mut i = 0usize;
    while out.len() < len {
        out.push_str(&format!("{}{} ", seed, i));
        i += 1;
        if i % 12 == 0 {
            out.push_str(".\n");
        }
    }
    out
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
