//! # quarry-embed
//!
//! Text embeddings for quarry, computed off the caller's runtime. Models run
//! either on a dedicated thread or in a separate worker process, and both
//! paths produce identical vectors for the same model and quantization.
//!
//! ## Features
//!
//! - **Out-of-line inference**: [`ThreadEmbedder`] and [`SubprocessEmbedder`] share one request/response protocol
//! - **Local ONNX Models**: E5-family models from the HuggingFace Hub, run through FastEmbed
//! - **Adaptive batching**: failing batches are halved until they fit, and the smaller size sticks
//! - **Registry**: named embedders with priority-based default selection
//! - **Deterministic test model**: the `hashing` model needs no download
//!
//! ## Quick Start
//!
//! ```no_run
//! use quarry_embed::{EmbedConfig, Embedder, ThreadEmbedder};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let embedder = ThreadEmbedder::new(EmbedConfig::default());
//! embedder.initialize(None).await?;
//!
//! let query = embedder.embed_query("how do I rotate keys?").await?;
//! let passages = embedder
//!     .embed_batch_documents(&["Keys rotate every 90 days.".to_string()])
//!     .await?;
//!
//! println!("{} dims, {} passages", query.len(), passages.len());
//! embedder.dispose().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`provider`]: the [`Embedder`] contract and the narrow [`EmbeddingProvider`] surface
//! - [`registry`]: named embedders and default selection
//! - [`executor`]: thread and subprocess executors over a shared request channel
//! - [`protocol`]: the JSON-lines messages exchanged with a worker
//! - [`worker`]: the worker side, shared by the thread executor and the `quarry-embed-worker` binary
//! - [`pipeline`]: synchronous ONNX and hashing pipelines run inside a worker
//! - [`fallback`]: adaptive batch-size fallback
//! - [`downloader`]: HuggingFace model downloads
//! - [`model`]: per-model facts (dimensions, prefixes) and text cleanup
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`] type.
//! Worker crashes reject every pending request with
//! [`EmbedError::WorkerCrashed`]; the embedder must be initialized again.

pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod executor;
pub mod fallback;
pub mod model;
pub mod pipeline;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod worker;

// Re-export main types for easy access
pub use config::{EmbedConfig, EmbedConfigBuilder, SubprocessConfig};
pub use downloader::ModelDownloader;
pub use error::{EmbedError, Result};
pub use events::{EmbedEvent, EmbedWarning, ProgressCallback, ProgressUpdate};
pub use executor::{SubprocessEmbedder, ThreadEmbedder};
pub use model::{ModelSpec, Quantization};
pub use provider::{Embedder, EmbeddingDetails, EmbeddingProvider, EmbeddingResult};
pub use registry::{EmbedderRegistry, RegistryProvider};
