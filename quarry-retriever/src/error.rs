//! Error types for quarry-retriever

use crate::storage::BackendKind;
use quarry_embed::EmbedError;
use thiserror::Error;

/// Result type alias for retriever operations
pub type Result<T> = std::result::Result<T, Error>;

/// A configuration value outside its valid range or vocabulary.
///
/// Raised while options are parsed or resolved, never at first use.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {field}: {message}")]
pub struct ConfigurationError {
    /// Dotted path of the offending field, e.g. `sqlite.max_neighbors`
    pub field: String,
    /// What was wrong and which values are accepted
    pub message: String,
}

impl ConfigurationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur in storage, search and indexing
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("backend {backend} is unavailable: {reason}. {remediation}")]
    BackendUnavailable {
        backend: BackendKind,
        reason: String,
        remediation: String,
    },

    #[error("{backend} storage is not initialized; call initialize() first")]
    NotInitialized { backend: BackendKind },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("{backend} {operation} failed: {source}")]
    Database {
        backend: BackendKind,
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("database metadata error: {message}")]
    Metadata { message: String },

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn metadata<S: Into<String>>(message: S) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::new(field, message))
    }
}

/// Attach backend and operation context to `sqlx` failures.
pub(crate) trait DbContext<T> {
    fn db_context(self, backend: BackendKind, operation: &'static str) -> Result<T>;
}

impl<T> DbContext<T> for std::result::Result<T, sqlx::Error> {
    fn db_context(self, backend: BackendKind, operation: &'static str) -> Result<T> {
        self.map_err(|source| Error::Database {
            backend,
            operation,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_names_field() {
        let err = Error::configuration("sqlite.max_neighbors", "must be at least 1, got 0");
        assert_eq!(
            err.to_string(),
            "invalid sqlite.max_neighbors: must be at least 1, got 0"
        );
    }

    #[test]
    fn test_db_context() {
        let failed: std::result::Result<(), sqlx::Error> = Err(sqlx::Error::RowNotFound);
        let err = failed.db_context(BackendKind::Sqlite, "get_document").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sqlite"));
        assert!(message.contains("get_document"));
    }
}
