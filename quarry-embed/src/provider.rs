//! The embedder contract and the reduced provider surface used by indexing pipelines

use crate::error::Result;
use crate::events::{EmbedEvent, ProgressCallback};
use crate::model::approximate_tokens;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result.
    ///
    /// The dimension is inferred from the first vector, or 0 when empty.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// A vector plus the facts a caller usually wants to log next to it.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingDetails {
    pub embedding: Vec<f32>,
    pub model_id: String,
    pub dimensions: usize,
    /// Character count / 4, rounded up
    pub approximate_tokens: usize,
}

/// Full capability surface of a text embedding model.
///
/// Implementations keep inference off the caller's task: every `embed*` call
/// is a suspension point. `initialize` is idempotent and concurrent callers
/// wait on the attempt already in flight.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable registry name
    fn name(&self) -> &str;

    fn model_id(&self) -> &str;

    /// Vector length. Reported by the worker once ready, derived from the model id before that.
    fn dimensions(&self) -> usize;

    fn max_tokens(&self) -> usize;

    fn is_multilingual(&self) -> bool;

    /// Higher wins when the registry picks a default
    fn priority(&self) -> i32;

    async fn initialize(&self, progress: Option<ProgressCallback>) -> Result<()>;

    fn is_ready(&self) -> bool;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query, adding the model's query prefix if it has one.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a passage, adding the model's passage prefix if it has one.
    async fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    /// Batched form of [`Embedder::embed_document`].
    async fn embed_batch_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed_document(text).await?);
        }
        Ok(vectors)
    }

    async fn embed_with_details(&self, text: &str) -> Result<EmbeddingDetails> {
        let embedding = self.embed(text).await?;
        Ok(EmbeddingDetails {
            dimensions: embedding.len(),
            embedding,
            model_id: self.model_id().to_string(),
            approximate_tokens: approximate_tokens(text),
        })
    }

    /// Release the model and its execution context. The embedder may be initialized again.
    async fn dispose(&self) -> Result<()>;

    /// Progress and warning events, including adaptive batch fallback warnings.
    fn subscribe(&self) -> broadcast::Receiver<EmbedEvent>;
}

/// Trait for embedding providers that can generate embeddings from text.
///
/// This is the narrow surface generic indexing code depends on. The registry
/// exposes its default [`Embedder`] through it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_result() {
        let result = EmbeddingResult::new(vec![vec![0.0; 3], vec![1.0; 3]]);
        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());

        let empty = EmbeddingResult::new(Vec::new());
        assert!(empty.is_empty());
        assert_eq!(empty.dimension, 0);
    }
}
