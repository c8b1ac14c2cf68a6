//! Backend selection and database metadata.
//!
//! [`StorageFactory::open`] decides which backend serves a data directory.
//! A database keeps the backend, options and embedding dimensions it was
//! created with; a caller asking for something else gets the existing
//! database plus a [`ConfigMismatch`] describing the difference.

use super::metadata::DatabaseMetadata;
use super::options::{
    BackendKind, BackendOptions, BackendOptionsPatch, merge_backend_options, validate_backend_options,
};
use super::StorageAdapter;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// What the host runtime can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    /// Whether native (C) database engines can be linked and loaded
    pub native_extensions_supported: bool,
}

impl RuntimeCapabilities {
    pub fn native() -> Self {
        Self {
            native_extensions_supported: true,
        }
    }

    /// A sandboxed host limited to network backends.
    pub fn constrained() -> Self {
        Self {
            native_extensions_supported: false,
        }
    }
}

impl Default for RuntimeCapabilities {
    fn default() -> Self {
        Self::native()
    }
}

/// Everything a provider needs to construct an adapter.
#[derive(Debug, Clone)]
pub struct OpenContext {
    pub data_dir: PathBuf,
    pub options: BackendOptions,
    pub embedding_dimensions: usize,
    pub connection_url: Option<String>,
    pub max_queue_depth: usize,
}

/// Constructs adapters for one backend.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap availability check. Must not panic.
    fn probe(&self) -> bool;

    /// Build an adapter. The factory calls `initialize` on it.
    async fn open(&self, ctx: &OpenContext) -> Result<Arc<dyn StorageAdapter>>;
}

#[cfg(feature = "sqlite")]
pub struct SqliteProvider;

#[cfg(feature = "sqlite")]
#[async_trait]
impl BackendProvider for SqliteProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn probe(&self) -> bool {
        true
    }

    async fn open(&self, ctx: &OpenContext) -> Result<Arc<dyn StorageAdapter>> {
        use super::options::SqliteOptions;
        use super::sqlite_store::SqliteStore;

        let options = ctx
            .options
            .typed::<SqliteOptions>()
            .cloned()
            .ok_or_else(|| Error::configuration("backend_options", "expected sqlite options"))?;
        let store = SqliteStore::new(&ctx.data_dir, options, ctx.embedding_dimensions)
            .with_max_queue_depth(ctx.max_queue_depth);
        Ok(Arc::new(store))
    }
}

#[cfg(feature = "postgres")]
pub struct PostgresProvider;

#[cfg(feature = "postgres")]
#[async_trait]
impl BackendProvider for PostgresProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn probe(&self) -> bool {
        true
    }

    async fn open(&self, ctx: &OpenContext) -> Result<Arc<dyn StorageAdapter>> {
        use super::options::PostgresOptions;
        use super::postgres_store::PostgresStore;

        let options = ctx
            .options
            .typed::<PostgresOptions>()
            .cloned()
            .ok_or_else(|| Error::configuration("backend_options", "expected postgres options"))?;
        let url = ctx
            .connection_url
            .clone()
            .ok_or_else(|| Error::configuration("storage.connection_url", "required by the postgres backend"))?;
        let store =
            PostgresStore::new(url, options, ctx.embedding_dimensions).with_max_queue_depth(ctx.max_queue_depth);
        Ok(Arc::new(store))
    }
}

/// Providers keyed by backend.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<BackendKind, Arc<dyn BackendProvider>>,
}

impl ProviderRegistry {
    /// A registry with no providers.
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Replaces any provider already registered for the same backend.
    pub fn register(&mut self, provider: Arc<dyn BackendProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendProvider>> {
        self.providers.get(&kind).cloned()
    }
}

impl Default for ProviderRegistry {
    /// The providers compiled into this build.
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::empty();
        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(SqliteProvider));
        #[cfg(feature = "postgres")]
        registry.register(Arc::new(PostgresProvider));
        registry
    }
}

/// A caller setting that lost to what the database already records.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigMismatch {
    Backend {
        requested: BackendKind,
        stored: BackendKind,
    },
    Options {
        requested: BackendOptionsPatch,
        stored: BackendOptions,
    },
    EmbeddingDimensions {
        requested: usize,
        stored: usize,
    },
}

impl fmt::Display for ConfigMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigMismatch::Backend { requested, stored } => {
                write!(f, "requested backend {requested}, database uses {stored}")
            }
            ConfigMismatch::Options { requested, stored } => write!(
                f,
                "requested {} options differ from stored {} options; stored options are used",
                requested.backend(),
                stored.backend()
            ),
            ConfigMismatch::EmbeddingDimensions { requested, stored } => {
                write!(f, "requested {requested} embedding dimensions, database uses {stored}")
            }
        }
    }
}

/// The result of [`StorageFactory::open`].
pub struct OpenedStorage {
    pub adapter: Arc<dyn StorageAdapter>,
    pub metadata: DatabaseMetadata,
    pub mismatches: Vec<ConfigMismatch>,
    /// Whether this open created the database
    pub created: bool,
}

impl fmt::Debug for OpenedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedStorage")
            .field("backend", &self.adapter.backend())
            .field("metadata", &self.metadata)
            .field("mismatches", &self.mismatches)
            .field("created", &self.created)
            .finish()
    }
}

fn unavailable(backend: BackendKind, reason: impl Into<String>, remediation: impl Into<String>) -> Error {
    Error::BackendUnavailable {
        backend,
        reason: reason.into(),
        remediation: remediation.into(),
    }
}

fn missing_provider(backend: BackendKind) -> Error {
    let remediation = match backend {
        BackendKind::Sqlite => "Rebuild quarry-retriever with the `sqlite` feature.".to_string(),
        BackendKind::Postgres => "Rebuild quarry-retriever with `--features postgres`.".to_string(),
        BackendKind::Lancedb | BackendKind::Libsql => format!(
            "Use the sqlite or postgres backend, or register a BackendProvider for {backend}."
        ),
    };
    unavailable(backend, "no provider is available in this build", remediation)
}

/// Opens storage for a data directory.
#[derive(Clone, Default)]
pub struct StorageFactory {
    providers: ProviderRegistry,
}

impl StorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_providers(providers: ProviderRegistry) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Whether `kind` could be opened here. Never fails.
    pub fn is_available(&self, kind: BackendKind, caps: RuntimeCapabilities) -> bool {
        if kind.requires_native_extensions() && !caps.native_extensions_supported {
            return false;
        }
        self.providers.get(kind).is_some_and(|p| p.probe())
    }

    /// Open (creating if needed) the database described by `config`.
    pub async fn open(&self, config: &StorageConfig, caps: RuntimeCapabilities) -> Result<OpenedStorage> {
        config.validate()?;
        let stored = DatabaseMetadata::read(&config.data_dir).await?;
        let backend = stored
            .as_ref()
            .map(|m| m.backend)
            .or(config.backend)
            .unwrap_or(BackendKind::Sqlite);

        if backend.requires_native_extensions() && !caps.native_extensions_supported {
            return Err(unavailable(
                backend,
                "it requires native extensions, which this runtime does not support",
                "Use the postgres backend with a connection_url.",
            ));
        }

        let provider = self
            .providers
            .get(backend)
            .filter(|p| p.probe())
            .ok_or_else(|| missing_provider(backend))?;

        let options = match &stored {
            Some(metadata) => metadata.backend_options.clone(),
            None => merge_backend_options(backend, config.backend_options.as_ref()),
        };
        validate_backend_options(&options)?;
        let embedding_dimensions = stored
            .as_ref()
            .map(|m| m.embedding_dimensions)
            .unwrap_or(config.embedding_dimensions);

        let ctx = OpenContext {
            data_dir: config.data_dir.clone(),
            options: options.clone(),
            embedding_dimensions,
            connection_url: config.connection_url.clone(),
            max_queue_depth: config.max_queue_depth,
        };
        let adapter = provider.open(&ctx).await?;
        adapter.initialize().await?;

        let (metadata, created) = match stored {
            Some(metadata) => (metadata, false),
            None => {
                let metadata = DatabaseMetadata::new(options, embedding_dimensions);
                if metadata.write_if_absent(&config.data_dir).await? {
                    info!(backend = %backend, "Created {} database in {}", backend, config.data_dir.display());
                    (metadata, true)
                } else {
                    // Lost a creation race; the winner's record is authoritative.
                    let existing = DatabaseMetadata::read(&config.data_dir)
                        .await?
                        .ok_or_else(|| Error::metadata("metadata disappeared while opening"))?;
                    (existing, false)
                }
            }
        };

        let mismatches = if created {
            Vec::new()
        } else {
            detect_mismatches(config, &metadata)
        };
        for mismatch in &mismatches {
            warn!(backend = %metadata.backend, "backend mismatch: {mismatch}");
        }

        Ok(OpenedStorage {
            adapter,
            metadata,
            mismatches,
            created,
        })
    }
}

fn detect_mismatches(config: &StorageConfig, metadata: &DatabaseMetadata) -> Vec<ConfigMismatch> {
    let mut mismatches = Vec::new();
    if let Some(requested) = config.backend.filter(|b| *b != metadata.backend) {
        mismatches.push(ConfigMismatch::Backend {
            requested,
            stored: metadata.backend,
        });
    }
    if let Some(patch) = &config.backend_options {
        let same = patch.backend() == metadata.backend
            && merge_backend_options(metadata.backend, Some(patch)) == metadata.backend_options;
        if !same {
            mismatches.push(ConfigMismatch::Options {
                requested: patch.clone(),
                stored: metadata.backend_options.clone(),
            });
        }
    }
    if config.embedding_dimensions != metadata.embedding_dimensions {
        mismatches.push(ConfigMismatch::EmbeddingDimensions {
            requested: config.embedding_dimensions,
            stored: metadata.embedding_dimensions,
        });
    }
    mismatches
}

/// Whether `kind` can be opened with the providers compiled into this build.
pub fn is_backend_available(kind: BackendKind, caps: RuntimeCapabilities) -> bool {
    StorageFactory::default().is_available(kind, caps)
}
