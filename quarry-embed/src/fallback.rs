//! Adaptive batch-size fallback.
//!
//! Large batches are the usual reason a model runs out of memory or time, so a
//! failed batch is retried at half the size, split into sub-batches when it no
//! longer fits. The smaller size sticks for the rest of the session. Only
//! [`AdaptiveBatchSize::reset`] restores the configured value.
//!
//! ```text
//! batch(12) @16 ✗ → warn 16→8 → [8] @8 ✗ → warn 8→4 → [4] ✓ [4] ✓
//!                                [4] @8 ✓
//! ```

use crate::error::{EmbedError, Result};
use crate::events::{EmbedEvent, EmbedWarning, emit};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// The working batch size of one executor.
#[derive(Debug)]
pub struct AdaptiveBatchSize {
    configured: usize,
    current: AtomicUsize,
}

impl AdaptiveBatchSize {
    pub fn new(configured: usize) -> Self {
        let configured = configured.max(1);
        Self {
            configured,
            current: AtomicUsize::new(configured),
        }
    }

    pub fn configured(&self) -> usize {
        self.configured
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Restore the configured batch size.
    pub fn reset(&self) {
        self.current.store(self.configured, Ordering::SeqCst);
    }

    /// Never grows the working size.
    fn shrink_to(&self, size: usize) {
        self.current.fetch_min(size, Ordering::SeqCst);
    }

    /// Embed `texts` in batches of the working size, falling back on failure.
    ///
    /// `attempt` performs one worker call for one batch. Vectors come back in
    /// input order.
    pub async fn run<F, Fut>(
        &self,
        texts: &[String],
        events: &broadcast::Sender<EmbedEvent>,
        attempt: F,
    ) -> Result<Vec<Vec<f32>>>
    where
        F: Fn(Vec<String>) -> Fut + Sync,
        Fut: Future<Output = Result<Vec<Vec<f32>>>> + Send,
    {
        let mut vectors = Vec::with_capacity(texts.len());
        let mut offset = 0;
        while offset < texts.len() {
            let batch_size = self.current();
            let end = (offset + batch_size).min(texts.len());
            let batch = texts[offset..end].to_vec();
            vectors.extend(
                self.attempt_batch(batch, batch_size, events, &attempt)
                    .await?,
            );
            offset = end;
        }
        Ok(vectors)
    }

    fn attempt_batch<'a, F, Fut>(
        &'a self,
        texts: Vec<String>,
        batch_size: usize,
        events: &'a broadcast::Sender<EmbedEvent>,
        attempt: &'a F,
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>
    where
        F: Fn(Vec<String>) -> Fut + Sync,
        Fut: Future<Output = Result<Vec<Vec<f32>>>> + Send + 'a,
    {
        async move {
            let expected = texts.len();
            let error = match attempt(texts.clone()).await {
                Ok(vectors) if vectors.len() == expected => return Ok(vectors),
                Ok(vectors) => {
                    return Err(EmbedError::protocol(format!(
                        "expected {expected} embeddings, worker returned {}",
                        vectors.len()
                    )));
                }
                Err(error) => error,
            };

            if !error.allows_batch_fallback() {
                return Err(error);
            }
            if batch_size <= 1 {
                return Err(EmbedError::BatchExhausted {
                    source: Box::new(error),
                });
            }

            let new_size = (batch_size / 2).max(1);
            warn!(
                previous_batch_size = batch_size,
                new_batch_size = new_size,
                "Embedding batch failed, retrying with smaller batches: {error}"
            );
            self.shrink_to(new_size);
            emit(
                events,
                EmbedEvent::Warning(EmbedWarning::BatchSizeFallback {
                    previous_batch_size: batch_size,
                    new_batch_size: new_size,
                    error: error.to_string(),
                }),
            );

            if texts.len() <= new_size {
                return self
                    .attempt_batch(texts, new_size, events, attempt)
                    .await;
            }

            debug!("Splitting {} texts into batches of {new_size}", texts.len());
            let mut vectors = Vec::with_capacity(texts.len());
            for chunk in texts.chunks(new_size) {
                vectors.extend(
                    self.attempt_batch(chunk.to_vec(), new_size, events, attempt)
                        .await?,
                );
            }
            Ok(vectors)
        }
        .boxed()
    }
}
