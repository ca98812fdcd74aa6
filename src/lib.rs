//! # findme
//!
//! Keeps a local vector index in sync with a folder of documents and
//! answers similarity queries over it.
//!
//! A folder is indexed once with a full build; after that a watch coalesces
//! filesystem events and applies them incrementally. Stale vectors for
//! changed or deleted files are removed by rebuilding the index without
//! them, since the store itself is append-only.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐  events   ┌───────────┐  batch   ┌──────────┐
//!  │  notify  │──────────▶│ Coalescer │─────────▶│   sync   │──┐
//!  └──────────┘           └───────────┘          └──────────┘  │ purge + add
//!                                                              ▼
//!  ┌──────────┐  full build ┌─────────────┐  chunks+vectors ┌────────────┐
//!  │  Engine  │────────────▶│ IndexBuilder│────────────────▶│ FolderIndex│
//!  └────┬─────┘             └─────────────┘                 └─────┬──────┘
//!       │ search                                                  │
//!       └───────────────────────▶ query ◀─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`limits`] | Range-validated tunables persisted to `app_config.json` |
//! | [`layout`] | On-disk layout of the storage root |
//! | [`files`] | File classification and folder scanning |
//! | [`extract`] | Text extraction for txt, csv, pdf, docx, pptx, xlsx |
//! | [`embedding`] | Embedding providers |
//! | [`index_store`] | Persisted per-folder vector index |
//! | [`purge`] | Delete-by-rebuild of stale vectors |
//! | [`status`] | Shared build status |
//! | [`builder`] | Full index builds |
//! | [`coalescer`] | Debounced coalescing of filesystem events |
//! | [`sync`] | Applying change batches to an index |
//! | [`watcher`] | Folder watches and their persisted registry |
//! | [`query`] | Similarity search with dedup and highlighting |
//! | [`engine`] | The request surface shared by CLI and server |
//! | [`server`] | JSON HTTP API |

pub mod builder;
pub mod coalescer;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod files;
pub mod index_store;
pub mod layout;
pub mod limits;
pub mod progress;
pub mod purge;
pub mod query;
pub mod server;
pub mod status;
pub mod sync;
pub mod telemetry;
pub mod watcher;

pub use engine::{BuildHandle, Engine};
pub use error::SyncError;
