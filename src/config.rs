use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use findme_core::chunk::ChunkSpec;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one index directory per folder plus the JSON state files.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./vector_store")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Requested output dimensionality; omitted from requests when unset.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Maximum rows per embedding call.
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_url(),
            api_key_env: default_api_key_env(),
            dims: None,
            batch_rows: default_batch_rows(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}
fn default_api_key_env() -> String {
    "DASHSCOPE_API_KEY".to_string()
}
fn default_batch_rows() -> usize {
    25
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    150
}

impl ChunkingConfig {
    pub fn spec(&self) -> ChunkSpec {
        ChunkSpec {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Pending chunk count that triggers a partial flush.
    #[serde(default = "default_flush_chunk_threshold")]
    pub flush_chunk_threshold: usize,
    /// A partial flush also happens every this many source files.
    #[serde(default = "default_flush_file_interval")]
    pub flush_file_interval: usize,
    /// Paths matching any of these globs are never scanned.
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            flush_chunk_threshold: default_flush_chunk_threshold(),
            flush_file_interval: default_flush_file_interval(),
            exclude_globs: default_exclude_globs(),
            follow_symlinks: false,
        }
    }
}

fn default_flush_chunk_threshold() -> usize {
    100
}
fn default_flush_file_interval() -> usize {
    20
}
fn default_exclude_globs() -> Vec<String> {
    vec!["**/node_modules/**".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_fallback_k")]
    pub fallback_k: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            fallback_k: default_fallback_k(),
            max_results: default_max_results(),
        }
    }
}

fn default_candidate_k() -> usize {
    25
}
fn default_fallback_k() -> usize {
    10
}
fn default_max_results() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Quiet period after the last filesystem event before a batch is applied.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    /// Restore watches recorded in `monitoring_config.json` at startup.
    #[serde(default = "default_restore")]
    pub restore_on_start: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            restore_on_start: default_restore(),
        }
    }
}

fn default_quiet_period_ms() -> u64 {
    5000
}
fn default_restore() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// Parse and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` when it exists, otherwise fall back to built-in defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.embedding.batch_rows == 0 {
        bail!("embedding.batch_rows must be > 0");
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0 when set");
    }

    if config.indexing.flush_chunk_threshold == 0 || config.indexing.flush_file_interval == 0 {
        bail!("indexing.flush_chunk_threshold and indexing.flush_file_interval must be > 0");
    }

    if config.search.max_results == 0 {
        bail!("search.max_results must be >= 1");
    }
    if config.search.candidate_k < config.search.max_results
        || config.search.fallback_k < config.search.max_results
    {
        bail!("search.candidate_k and search.fallback_k must be >= search.max_results");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
