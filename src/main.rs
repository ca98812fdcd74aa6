//! # findme CLI
//!
//! Builds and watches per-folder vector indexes and searches them, either
//! directly from the command line or through the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! findme --config ./config/findme.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `findme index <folder>` | Build or update the index for a folder |
//! | `findme search "<query>" --folder <folder>` | Search a folder's index |
//! | `findme watch <folder>` | Keep a folder's index in sync until Ctrl-C |
//! | `findme status [folder]` | Show index and watch state |
//! | `findme clean` | Delete every stored index |
//! | `findme config show` / `set` | Show or change the tunable limits |
//! | `findme serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! export DASHSCOPE_API_KEY=...
//! findme index ~/Documents/reports
//! findme search "quarterly revenue" --folder ~/Documents/reports
//! findme config set --max-file-size-mb 200 --embedding-model text-embedding-v3
//! findme serve
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use findme::config;
use findme::engine::Engine;
use findme::limits::LimitsUpdate;
use findme::progress::{BuildProgressEvent, ProgressMode};
use findme::{server, telemetry};

/// findme keeps a local vector index in sync with a folder of documents
/// and answers similarity queries over it.
#[derive(Parser)]
#[command(name = "findme", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/findme.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/findme.toml")]
    config: PathBuf,

    /// Log debug output from findme.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or incrementally update the index for a folder.
    ///
    /// Unchanged files are skipped; changed and deleted files are
    /// re-indexed or purged.
    Index {
        folder: String,

        /// Keep watching the folder after the build, until Ctrl-C.
        #[arg(long)]
        watch: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Search a folder's index.
    Search {
        query: String,

        #[arg(long)]
        folder: String,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Watch a folder and apply changes to its index until Ctrl-C.
    Watch { folder: String },

    /// Show whether a folder has an index, and the persisted watch list.
    Status { folder: Option<String> },

    /// Delete every stored index. Limits are kept.
    Clean,

    /// Show or change the tunable limits.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Change one or more limits. Nothing changes if any value is out of range.
    Set {
        #[arg(long)]
        max_text_length: Option<usize>,
        #[arg(long)]
        max_chunk_count: Option<usize>,
        #[arg(long)]
        max_file_size_mb: Option<u64>,
        #[arg(long)]
        embedding_model: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let cfg = config::load_or_default(&cli.config)?;
    if !cfg.embedding.is_enabled() {
        tracing::warn!("embedding provider is disabled, builds and searches will fail");
    }
    let engine = Engine::new(cfg)?;

    match cli.command {
        Commands::Index {
            folder,
            watch,
            progress,
        } => {
            let mode = progress.map(ProgressMode::from).unwrap_or_else(ProgressMode::default_for_tty);
            run_index(&engine, &folder, watch, mode).await?;
        }
        Commands::Search { query, folder, json } => {
            let hits = engine.search(&query, &folder).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!("{}. [{:.4}] {}", i + 1, hit.score, hit.source);
                    println!("    {}", snippet(&hit.highlighted_content));
                }
            }
        }
        Commands::Watch { folder } => {
            engine.start_watch(&folder).await?;
            println!("watching {} (Ctrl-C to stop)", folder);
            tokio::signal::ctrl_c().await?;
            engine.stop_all_watches().await?;
        }
        Commands::Status { folder } => {
            if let Some(folder) = &folder {
                let exists = engine.index_exists(folder)?;
                println!("index: {}", if exists { "present" } else { "missing" });
            }
            let watched = findme::watcher::load_watch_state(&engine.layout().watch_state_file());
            println!("monitored folders: {}", watched.len());
            for f in watched {
                println!("  {}", f.display());
            }
        }
        Commands::Clean => {
            let removed = engine.purge_all().await?;
            println!("removed {} index(es)", removed);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&engine.limits_view())?);
            }
            ConfigAction::Set {
                max_text_length,
                max_chunk_count,
                max_file_size_mb,
                embedding_model,
            } => {
                let update = LimitsUpdate {
                    max_text_length,
                    max_chunk_count,
                    max_file_size_mb,
                    embedding_model,
                };
                let limits = engine.update_limits(&update)?;
                println!("{}", serde_json::to_string_pretty(&limits)?);
            }
        },
        Commands::Serve => {
            if engine.config().watch.restore_on_start {
                engine.restore_watches().await;
            }
            server::run_server(engine).await?;
        }
    }

    Ok(())
}

async fn run_index(engine: &Engine, folder: &str, watch: bool, mode: ProgressMode) -> anyhow::Result<()> {
    let reporter = mode.reporter();
    let handle = engine.start_index(folder)?;
    let key = handle.folder().to_string();
    if watch {
        engine.start_watch(&key).await?;
    }

    let mut last: Option<BuildProgressEvent> = None;
    while !handle.is_finished() {
        let event = BuildProgressEvent::from(&engine.status());
        if last.as_ref() != Some(&event) {
            reporter.report(&event);
            last = Some(event);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let result = handle.wait().await;
    let status = engine.status();
    reporter.report(&BuildProgressEvent::from(&status));

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if watch {
                engine.stop_all_watches().await?;
            }
            for f in &status.failed_files {
                eprintln!("  failed: {} ({})", f.path, f.reason.as_deref().unwrap_or("unknown"));
            }
            bail!("index {} failed: {}", key, e);
        }
    };

    println!("index {}", report.folder);
    println!("  succeeded: {}", report.stats.success_count);
    println!("  failed: {}", report.stats.failure_count);
    println!("  skipped: {}", report.stats.skipped_count);
    println!("  chunks added: {}", report.chunks_added);
    if report.chunks_dropped > 0 {
        println!("  chunks dropped: {}", report.chunks_dropped);
    }
    if report.purged > 0 {
        println!("  stale chunks purged: {}", report.purged);
    }
    println!("  documents: {}", report.documents);
    println!("{}", report.message);

    if watch {
        println!("watching {} (Ctrl-C to stop)", key);
        tokio::signal::ctrl_c().await?;
        engine.stop_all_watches().await?;
    }
    Ok(())
}

/// First line of a hit, shortened for terminal output.
fn snippet(content: &str) -> String {
    let flat: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 160 {
        let cut: String = flat.chars().take(157).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}
