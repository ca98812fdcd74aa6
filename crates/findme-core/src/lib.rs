//! # findme core
//!
//! Pure logic shared by the `findme` application: document models,
//! chunking, the embedder trait, the [`VectorStore`](store::VectorStore)
//! abstraction with its flat exact-L2 implementation, and result
//! deduplication/highlighting.
//!
//! This crate performs no filesystem or network I/O. Persistence is
//! expressed as byte encoding only; the application decides where the
//! bytes live.

pub mod chunk;
pub mod embedding;
pub mod models;
pub mod search;
pub mod store;
