//! Configuration for embedders and their execution contexts

use crate::error::{EmbedError, Result};
use crate::model::{DEFAULT_MODEL_ID, HASHING_MODEL_ID, Quantization};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the worker binary for [`SubprocessConfig`].
pub const WORKER_PROGRAM_ENV: &str = "QUARRY_EMBED_WORKER";

/// Binary looked up on `PATH` when [`WORKER_PROGRAM_ENV`] is unset.
pub const DEFAULT_WORKER_PROGRAM: &str = "quarry-embed-worker";

/// Configuration for one embedder instance.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct EmbedConfig {
    /// Registry name of the embedder
    #[builder(default = r#""local".to_string()"#)]
    pub name: String,
    /// HuggingFace repository id, or `hashing` for the built-in hashing model
    #[builder(default = "DEFAULT_MODEL_ID.to_string()")]
    pub model_id: String,
    /// ONNX weight variant
    #[builder(default)]
    pub quantization: Quantization,
    /// Where downloaded model files are cached (HuggingFace cache layout)
    #[builder(default)]
    pub cache_dir: Option<PathBuf>,
    /// Texts per worker call before adaptive fallback kicks in
    #[builder(default = "16")]
    pub batch_size: usize,
    /// Time allowed for model download and load
    #[builder(default = "Duration::from_secs(600)")]
    #[serde(with = "duration_secs")]
    pub init_timeout: Duration,
    /// Time allowed for any single embedding request
    #[builder(default = "Duration::from_secs(120)")]
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Higher priority embedders become the registry default
    #[builder(default = "10")]
    pub priority: i32,
}

impl EmbedConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(0) = self.batch_size {
            return Err("batch_size must be at least 1".to_string());
        }
        if let Some(model) = &self.model_id {
            if model.trim().is_empty() {
                return Err("model_id must not be blank".to_string());
            }
        }
        Ok(())
    }
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            quantization: Quantization::default(),
            cache_dir: None,
            batch_size: 16,
            init_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(120),
            priority: 10,
        }
    }
}

impl EmbedConfig {
    /// Create a new embedding configuration using the builder
    pub fn builder() -> EmbedConfigBuilder {
        EmbedConfigBuilder::default()
    }

    /// Configuration for the deterministic feature hashing model. It needs no
    /// download, which makes it the fallback of last resort and the model of
    /// choice for tests.
    pub fn hashing() -> Self {
        Self {
            name: HASHING_MODEL_ID.to_string(),
            model_id: HASHING_MODEL_ID.to_string(),
            priority: 0,
            init_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Set the registry name (builder style)
    pub fn with_name<S: Into<String>>(self, name: S) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn with_cache_dir<P: Into<PathBuf>>(self, cache_dir: P) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
            ..self
        }
    }

    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    /// Check the values that the builder cannot see when the struct was made
    /// by hand or deserialized.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.model_id.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_id must not be blank"));
        }
        if self.init_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(EmbedError::invalid_config("timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// How to launch the out-of-process worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// How long the worker gets to exit after a shutdown message before it is killed
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        let program = std::env::var_os(WORKER_PROGRAM_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_PROGRAM));
        Self {
            program,
            args: Vec::new(),
            env: Vec::new(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SubprocessConfig {
    pub fn with_program<P: Into<PathBuf>>(self, program: P) -> Self {
        Self {
            program: program.into(),
            ..self
        }
    }

    pub fn with_shutdown_grace(self, shutdown_grace: Duration) -> Self {
        Self {
            shutdown_grace,
            ..self
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = EmbedConfig::builder().build().unwrap();
        assert_eq!(config, EmbedConfig::default());
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.quantization, Quantization::Q8);
    }

    #[test]
    fn test_builder_rejects_zero_batch() {
        assert!(EmbedConfig::builder().batch_size(0usize).build().is_err());
        assert!(EmbedConfig::builder().model_id("  ").build().is_err());
    }

    #[test]
    fn test_hashing_config() {
        let config = EmbedConfig::hashing().with_batch_size(4);
        assert_eq!(config.model_id, HASHING_MODEL_ID);
        assert_eq!(config.batch_size, 4);
        assert!(config.validate().is_ok());
        assert!(config.with_batch_size(0).validate().is_err());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: EmbedConfig =
            serde_json::from_str(r#"{"model_id": "hashing", "request_timeout": 2.5}"#).unwrap();
        assert_eq!(config.model_id, "hashing");
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.batch_size, 16);
    }
}
