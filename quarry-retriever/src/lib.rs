//! quarry-retriever: local hybrid document search
//!
//! This crate stores extracted document text as chunks with optional
//! embeddings and ranks them with a mix of full-text and vector search. It
//! runs embedded in the host process; the database lives in a local data
//! directory (or on a Postgres server).
//!
//! ## Key Modules
//!
//! - **[`storage`]**: the [`StorageAdapter`](storage::StorageAdapter) contract, backend options, the SQLite and Postgres stores, and the factory that picks between them
//! - **[`search`]**: reciprocal rank fusion, near-duplicate folding, per-document diversity and pagination
//! - **[`indexing`]**: queue-driven indexing of parsed documents
//! - **[`config`]**: the TOML configuration file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_retriever::config::QuarryConfig;
//! use quarry_retriever::search::SearchEngine;
//! use quarry_retriever::storage::{RuntimeCapabilities, StorageFactory};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = QuarryConfig::load("quarry.toml".as_ref()).await?;
//! let opened = StorageFactory::new()
//!     .open(&config.storage, RuntimeCapabilities::native())
//!     .await?;
//!
//! let mut engine = SearchEngine::new(opened.adapter, config.search.clone());
//! if let Some(embedder) = config.embedding.build()? {
//!     engine = engine.with_embedder(embedder);
//! }
//!
//! let response = engine.search(&engine.query("quarterly revenue")).await?;
//! for hit in response.results {
//!     println!("{:.3} {} {}", hit.score, hit.file_name, hit.chunk_text);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! DocumentSource → DocumentIndexer → StorageAdapter ← SearchEngine ← query
//!                        ↓                ↑                ↓
//!                  quarry-embed     StorageFactory   quarry-embed
//!                                  (quarry.meta.json)
//! ```

pub mod config;
pub mod error;
pub mod indexing;
pub mod search;
pub mod storage;
pub mod vector;

pub use error::{ConfigurationError, Error, Result};
