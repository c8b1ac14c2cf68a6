//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for every embedding operation, in-process or out-of-line.
///
/// # Error Categories
///
/// - **Configuration**: invalid model settings, unknown registry names
/// - **Startup**: the model or worker could not be brought up ([`EmbedError::Init`])
/// - **Per-request**: generation failures, timeouts, protocol violations
/// - **Executor-wide**: the worker died ([`EmbedError::WorkerCrashed`]) or adaptive
///   fallback ran out of room ([`EmbedError::BatchExhausted`])
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// The model or its execution context failed to load
    #[error("Embedding model initialization failed: {message}")]
    Init { message: String },

    /// The embedder was used before `initialize()` completed
    #[error("Embedder `{name}` is not initialized")]
    NotInitialized { name: String },

    /// A single request exceeded its allotted time. The worker may still be busy with it.
    #[error("Embedding request `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The worker reported a failure for one request
    #[error("Embedding generation failed: {message}")]
    Generation { message: String },

    /// Adaptive batch fallback reached a batch size of one and still failed
    #[error("Embedding failed even at batch size 1: {source}")]
    BatchExhausted {
        #[source]
        source: Box<EmbedError>,
    },

    /// The worker thread or subprocess died; every pending request was rejected
    #[error("Embedding worker crashed: {message}")]
    WorkerCrashed { message: String },

    /// The worker sent something the executor did not expect
    #[error("Embedding protocol error: {message}")]
    Protocol { message: String },

    /// IO errors talking to the worker or reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Message (de)serialization failures
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Wrap a model loading failure.
    pub fn init<S: Into<String>>(message: S) -> Self {
        Self::Init {
            message: message.into(),
        }
    }

    /// Wrap a failure reported while generating embeddings.
    pub fn generation<S: Into<String>>(message: S) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn worker_crashed<S: Into<String>>(message: S) -> Self {
        Self::WorkerCrashed {
            message: message.into(),
        }
    }

    /// Whether adaptive batch fallback may retry this failure at a smaller size.
    ///
    /// Only failures tied to the batch itself qualify. A dead worker or an
    /// uninitialized embedder will not be fixed by smaller batches.
    pub fn allows_batch_fallback(&self) -> bool {
        matches!(self, Self::Generation { .. } | Self::Timeout { .. })
    }
}
