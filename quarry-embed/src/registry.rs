//! Named embedders with priority-based default selection.

use crate::error::{EmbedError, Result};
use crate::provider::{Embedder, EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Entries {
    embedders: HashMap<String, Arc<dyn Embedder>>,
    /// Registration order, used for `names()` and priority ties
    order: Vec<String>,
    default: Option<String>,
}

/// Holds every embedder the host knows about.
///
/// The embedder with the highest [`Embedder::priority`] becomes the default
/// unless [`EmbedderRegistry::set_default`] picks one explicitly. When two
/// embedders share a priority the one registered first stays default.
#[derive(Default)]
pub struct EmbedderRegistry {
    entries: RwLock<Entries>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an embedder, replacing any embedder registered under the same name.
    pub fn register(&self, embedder: Arc<dyn Embedder>) {
        let name = embedder.name().to_string();
        let priority = embedder.priority();
        let mut entries = self.write();

        if entries.embedders.insert(name.clone(), embedder).is_some() {
            warn!("Replacing embedder {name}");
        } else {
            entries.order.push(name.clone());
        }

        let promote = match entries.default.as_ref() {
            None => true,
            Some(current) if current == &name => false,
            Some(current) => entries
                .embedders
                .get(current)
                .is_none_or(|existing| priority > existing.priority()),
        };
        if promote {
            debug!("Default embedder is now {name} (priority {priority})");
            entries.default = Some(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Embedder>> {
        self.read().embedders.get(name).cloned()
    }

    pub fn default_embedder(&self) -> Option<Arc<dyn Embedder>> {
        let entries = self.read();
        entries
            .default
            .as_ref()
            .and_then(|name| entries.embedders.get(name))
            .cloned()
    }

    pub fn default_name(&self) -> Option<String> {
        self.read().default.clone()
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        let mut entries = self.write();
        if !entries.embedders.contains_key(name) {
            return Err(EmbedError::invalid_config(format!(
                "no embedder named '{name}' is registered"
            )));
        }
        entries.default = Some(name.to_string());
        Ok(())
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    /// Look up `name` (or the default) and initialize it if it is not ready yet.
    pub async fn get_initialized(&self, name: Option<&str>) -> Result<Arc<dyn Embedder>> {
        let embedder = match name {
            Some(name) => self.get(name),
            None => self.default_embedder(),
        }
        .ok_or_else(|| match name {
            Some(name) => EmbedError::invalid_config(format!("no embedder named '{name}' is registered")),
            None => EmbedError::invalid_config("no embedders are registered"),
        })?;

        if !embedder.is_ready() {
            info!("Initializing embedder {}", embedder.name());
            embedder.initialize(None).await?;
        }
        Ok(embedder)
    }

    /// The default embedder behind the narrow [`EmbeddingProvider`] surface.
    ///
    /// The default is resolved on every call, so a later `set_default` is
    /// picked up by providers handed out earlier.
    pub fn indexing_provider(self: &Arc<Self>) -> RegistryProvider {
        RegistryProvider {
            registry: self.clone(),
        }
    }

    /// Dispose every embedder. All are attempted; the first failure is returned.
    pub async fn dispose_all(&self) -> Result<()> {
        let embedders: Vec<_> = self.read().embedders.values().cloned().collect();
        let mut first_error = None;
        for embedder in embedders {
            if let Err(e) = embedder.dispose().await {
                warn!("Failed to dispose embedder {}: {e}", embedder.name());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// [`EmbeddingProvider`] view over a registry's default embedder.
///
/// Texts are embedded as passages, since indexing pipelines feed document text.
#[derive(Clone)]
pub struct RegistryProvider {
    registry: Arc<EmbedderRegistry>,
}

impl RegistryProvider {
    async fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        self.registry.get_initialized(None).await
    }
}

#[async_trait]
impl EmbeddingProvider for RegistryProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder().await?.embed_document(text).await
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = self.embedder().await?.embed_batch_documents(texts).await?;
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.registry
            .default_embedder()
            .map(|e| e.dimensions())
            .unwrap_or(0)
    }

    fn provider_name(&self) -> &str {
        "registry-default"
    }
}
