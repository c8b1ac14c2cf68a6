//! The database metadata record.
//!
//! Stored as `quarry.meta.json` next to the database and read before any
//! backend code runs. It is written once, when the database is created, and
//! later opens never rewrite it.

use super::options::{BackendKind, BackendOptions};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const METADATA_FILE: &str = "quarry.meta.json";

/// Bumped when the logical schema changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub backend: BackendKind,
    pub backend_options: BackendOptions,
    pub embedding_dimensions: usize,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    /// Crate name and version that created the database
    pub created_by: String,
}

/// On-disk form, with the options kept raw so they go through the same
/// field-level checks as caller-supplied options.
#[derive(Deserialize)]
struct RawMetadata {
    backend: BackendKind,
    backend_options: serde_json::Value,
    embedding_dimensions: usize,
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    created_at: DateTime<Utc>,
    #[serde(default)]
    created_by: String,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl DatabaseMetadata {
    pub fn new(backend_options: BackendOptions, embedding_dimensions: usize) -> Self {
        Self {
            backend: backend_options.backend(),
            backend_options,
            embedding_dimensions,
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            created_by: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(METADATA_FILE)
    }

    /// Read the record in `data_dir`, or `None` if no database has been created there.
    pub async fn read(data_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(data_dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let raw: RawMetadata = serde_json::from_slice(&bytes)
            .map_err(|e| Error::metadata(format!("{}: {e}", path.display())))?;
        let backend_options = BackendOptions::from_value(raw.backend_options)?;
        if backend_options.backend() != raw.backend {
            return Err(Error::metadata(format!(
                "{}: backend is {} but backend_options are for {}",
                path.display(),
                raw.backend,
                backend_options.backend()
            )));
        }
        if raw.schema_version > SCHEMA_VERSION {
            return Err(Error::metadata(format!(
                "{}: schema version {} is newer than supported version {SCHEMA_VERSION}",
                path.display(),
                raw.schema_version
            )));
        }

        Ok(Some(Self {
            backend: raw.backend,
            backend_options,
            embedding_dimensions: raw.embedding_dimensions,
            schema_version: raw.schema_version,
            created_at: raw.created_at,
            created_by: raw.created_by,
        }))
    }

    /// Write the record unless one already exists. Returns whether it was written.
    pub async fn write_if_absent(&self, data_dir: &Path) -> Result<bool> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = Self::path_in(data_dir);
        let json = serde_json::to_vec_pretty(self)?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("Metadata already present at {}", path.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&json).await?;
        file.sync_all().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::options::default_backend_options;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_written_once() -> anyhow::Result<()> {
        let dir = tempdir()?;
        assert!(DatabaseMetadata::read(dir.path()).await?.is_none());

        let first = DatabaseMetadata::new(default_backend_options(BackendKind::Sqlite), 384);
        assert!(first.write_if_absent(dir.path()).await?);

        let second = DatabaseMetadata::new(default_backend_options(BackendKind::Libsql), 768);
        assert!(!second.write_if_absent(dir.path()).await?);

        let stored = DatabaseMetadata::read(dir.path()).await?.unwrap();
        assert_eq!(stored.backend, BackendKind::Sqlite);
        assert_eq!(stored.embedding_dimensions, 384);
        assert_eq!(stored.backend_options, first.backend_options);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_stored_options_are_configuration_errors() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let json = r#"{
            "backend": "sqlite",
            "backend_options": {"backend": "sqlite", "distance_metric": "hamming"},
            "embedding_dimensions": 384,
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        tokio::fs::write(DatabaseMetadata::path_in(dir.path()), json).await?;

        let err = DatabaseMetadata::read(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(ref c) if c.field == "sqlite.distance_metric"));
        Ok(())
    }
}
