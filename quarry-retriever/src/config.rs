//! TOML configuration for quarry.
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/quarry"
//! backend = "sqlite"
//! backend_options = { backend = "sqlite", distance_metric = "l2" }
//!
//! [embedding]
//! executor = "subprocess"
//! model = { model_id = "Xenova/multilingual-e5-small", batch_size = 32 }
//!
//! [search]
//! diversity = "cap_then_fill"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{Error, Result};
use crate::search::DiversityMode;
use crate::storage::{BackendKind, BackendOptionsPatch};
use quarry_embed::{EmbedConfig, Embedder, SubprocessConfig, SubprocessEmbedder, ThreadEmbedder};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory used when none is configured.
pub const DEFAULT_DATA_DIR: &str = ".quarry";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarryConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
}

impl QuarryConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: QuarryConfig =
            toml::from_str(text).map_err(|e| Error::configuration("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.search.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Requested backend; an existing database keeps the backend it was created with
    pub backend: Option<BackendKind>,
    #[serde(deserialize_with = "deserialize_patch", skip_serializing_if = "Option::is_none")]
    pub backend_options: Option<BackendOptionsPatch>,
    pub embedding_dimensions: usize,
    /// Server URL, required by the postgres backend
    pub connection_url: Option<String>,
    pub max_queue_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            backend: None,
            backend_options: None,
            embedding_dimensions: 384,
            connection_url: None,
            max_queue_depth: 10_000,
        }
    }
}

impl StorageConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_backend(self, backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
            ..self
        }
    }

    pub fn with_backend_options(self, backend_options: BackendOptionsPatch) -> Self {
        Self {
            backend_options: Some(backend_options),
            ..self
        }
    }

    pub fn with_embedding_dimensions(self, embedding_dimensions: usize) -> Self {
        Self {
            embedding_dimensions,
            ..self
        }
    }

    pub fn with_connection_url<S: Into<String>>(self, connection_url: S) -> Self {
        Self {
            connection_url: Some(connection_url.into()),
            ..self
        }
    }

    pub fn with_max_queue_depth(self, max_queue_depth: usize) -> Self {
        Self {
            max_queue_depth,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimensions == 0 {
            return Err(Error::configuration("storage.embedding_dimensions", "must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(Error::configuration("storage.max_queue_depth", "must be at least 1"));
        }
        Ok(())
    }
}

/// Route backend options through the same field-level checks as JSON input.
fn deserialize_patch<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<BackendOptionsPatch>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    value
        .map(BackendOptionsPatch::from_value)
        .transpose()
        .map_err(serde::de::Error::custom)
}

/// Where embeddings are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Keyword search only
    None,
    #[default]
    Thread,
    Subprocess,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub executor: ExecutorKind,
    pub model: EmbedConfig,
    /// Only used by the subprocess executor
    pub worker: SubprocessConfig,
}

impl EmbeddingConfig {
    /// Construct the configured embedder. It still needs `initialize`.
    pub fn build(&self) -> Result<Option<Arc<dyn Embedder>>> {
        self.model.validate()?;
        Ok(match self.executor {
            ExecutorKind::None => None,
            ExecutorKind::Thread => Some(Arc::new(ThreadEmbedder::new(self.model.clone())) as Arc<dyn Embedder>),
            ExecutorKind::Subprocess => Some(Arc::new(SubprocessEmbedder::new(
                self.model.clone(),
                self.worker.clone(),
            )) as Arc<dyn Embedder>),
        })
    }
}

/// Engine tunables plus the defaults applied to queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Reciprocal rank fusion constant
    pub rrf_k: f32,
    /// Candidates fetched per primitive, as a multiple of `limit + offset`
    pub candidate_multiplier: usize,
    pub limit: usize,
    pub diversity: DiversityMode,
    pub decay_factor: f32,
    pub max_per_document: usize,
    pub dedup: bool,
    pub dedup_threshold: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            candidate_multiplier: 2,
            limit: 10,
            diversity: DiversityMode::ScorePenalty,
            decay_factor: 0.85,
            max_per_document: 5,
            dedup: true,
            dedup_threshold: 0.97,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rrf_k.is_nan() || self.rrf_k <= 0.0 {
            return Err(Error::configuration("search.rrf_k", format!("must be positive, got {}", self.rrf_k)));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::configuration("search.candidate_multiplier", "must be at least 1"));
        }
        crate::search::check_query_ranges(
            "search",
            self.limit,
            self.decay_factor,
            self.max_per_document,
            self.dedup_threshold,
        )
    }
}
