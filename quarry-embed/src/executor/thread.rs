//! Embedder running its pipeline on a dedicated OS thread.

use super::{ExecutorCore, RequestChannel, Transport};
use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::events::{EmbedEvent, ProgressCallback};
use crate::pipeline::{PipelineFactory, default_factory};
use crate::protocol::{Request, Response};
use crate::provider::Embedder;
use crate::worker::{Flow, WorkerSession};
use async_trait::async_trait;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Runs a [`WorkerSession`] on its own thread and talks to it over channels.
///
/// If the thread dies, every pending request fails with
/// [`EmbedError::WorkerCrashed`] and the embedder stays not-ready until
/// [`Embedder::initialize`] is called again.
pub struct ThreadEmbedder {
    core: ExecutorCore,
    factory: PipelineFactory,
    link: Mutex<Option<Arc<ThreadLink>>>,
}

struct ThreadLink {
    requests: flume::Sender<Request>,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
    dispatcher: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Transport for ThreadLink {
    async fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send_async(request)
            .await
            .map_err(|_| EmbedError::worker_crashed("embedding worker thread is gone"))
    }
}

impl ThreadLink {
    fn spawn(factory: PipelineFactory, channel: RequestChannel, name: &str) -> Result<Self> {
        let (request_tx, request_rx) = flume::unbounded::<Request>();
        let (response_tx, response_rx) = flume::unbounded::<Response>();

        let thread = std::thread::Builder::new()
            .name(format!("quarry-embed-{name}"))
            .spawn(move || run_worker(factory, request_rx, response_tx))
            .map_err(|e| EmbedError::init(format!("cannot spawn embedding thread: {e}")))?;

        let dispatcher = tokio::spawn(async move {
            while let Ok(response) = response_rx.recv_async().await {
                if !channel.dispatch(response) {
                    break;
                }
            }
            if channel.is_ready() {
                error!("Embedding worker thread exited unexpectedly");
            }
            channel.fail_all("embedding worker thread exited");
        });

        Ok(Self {
            requests: request_tx,
            thread: std::sync::Mutex::new(Some(thread)),
            dispatcher,
        })
    }

    /// Ask the worker to stop and wait a little for the thread to finish.
    async fn shutdown(&self) {
        let _ = self.requests.send_async(Request::Shutdown).await;
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let joined = tokio::time::timeout(
                JOIN_GRACE,
                tokio::task::spawn_blocking(move || handle.join()),
            )
            .await;
            if joined.is_err() {
                warn!("Embedding worker thread still busy after {JOIN_GRACE:?}, detaching it");
            }
        }
        self.dispatcher.abort();
    }
}

fn run_worker(
    factory: PipelineFactory,
    requests: flume::Receiver<Request>,
    responses: flume::Sender<Response>,
) {
    let mut session = WorkerSession::new(factory);
    for request in requests.iter() {
        let flow = session.handle(request, &mut |response| {
            // The executor side only disappears when it is dropped.
            let _ = responses.send(response);
        });
        if flow == Flow::Stop {
            break;
        }
    }
    debug!("Embedding worker thread finished");
}

impl ThreadEmbedder {
    /// Create an embedder that loads its model with the default pipelines.
    pub fn new(config: EmbedConfig) -> Self {
        Self::with_factory(config, default_factory())
    }

    /// Create an embedder with a custom pipeline factory.
    pub fn with_factory(config: EmbedConfig, factory: PipelineFactory) -> Self {
        Self {
            core: ExecutorCore::new(config, "thread"),
            factory,
            link: Mutex::new(None),
        }
    }

    /// The working batch size after any adaptive fallback.
    pub fn batch_size(&self) -> usize {
        self.core.batch.current()
    }

    /// Undo adaptive fallback reductions.
    pub fn reset_batch_size(&self) {
        self.core.batch.reset();
    }

    async fn live_link(&self) -> Result<Arc<ThreadLink>> {
        if !self.core.channel.is_ready() {
            return Err(self.core.not_initialized());
        }
        self.link
            .lock()
            .await
            .clone()
            .ok_or_else(|| self.core.not_initialized())
    }
}

#[async_trait]
impl Embedder for ThreadEmbedder {
    fn name(&self) -> &str {
        &self.core.config.name
    }

    fn model_id(&self) -> &str {
        &self.core.config.model_id
    }

    fn dimensions(&self) -> usize {
        self.core.dimensions()
    }

    fn max_tokens(&self) -> usize {
        self.core.spec.max_tokens
    }

    fn is_multilingual(&self) -> bool {
        self.core.spec.multilingual
    }

    fn priority(&self) -> i32 {
        self.core.config.priority
    }

    async fn initialize(&self, progress: Option<ProgressCallback>) -> Result<()> {
        self.core.config.validate()?;
        let mut link = self.link.lock().await;
        if self.core.channel.is_ready() {
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.shutdown().await;
        }

        info!(
            "Starting embedding thread for {} ({})",
            self.core.config.name, self.core.config.model_id
        );
        self.core.channel.set_progress_callback(progress);
        let fresh = Arc::new(ThreadLink::spawn(
            self.factory.clone(),
            self.core.channel.clone(),
            &self.core.config.name,
        )?);

        let outcome = self.core.handshake(fresh.as_ref()).await;
        self.core.channel.set_progress_callback(None);
        match outcome {
            Ok(()) => {
                *link = Some(fresh);
                Ok(())
            }
            Err(e) => {
                fresh.shutdown().await;
                Err(e)
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.core.channel.is_ready()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let link = self.live_link().await?;
        let text = text.to_string();
        self.core
            .embed_one(link.as_ref(), |id| Request::Embed { id, text })
            .await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let link = self.live_link().await?;
        self.core.embed_many(link.as_ref(), texts, false).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let link = self.live_link().await?;
        let text = text.to_string();
        self.core
            .embed_one(link.as_ref(), |id| Request::EmbedQuery { id, text })
            .await
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        let link = self.live_link().await?;
        let text = text.to_string();
        self.core
            .embed_one(link.as_ref(), |id| Request::EmbedDocument { id, text })
            .await
    }

    async fn embed_batch_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let link = self.live_link().await?;
        self.core.embed_many(link.as_ref(), texts, true).await
    }

    async fn dispose(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        self.core.channel.set_ready(false);
        if let Some(current) = link.take() {
            current.shutdown().await;
        }
        self.core.channel.fail_all("embedder disposed");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EmbedEvent> {
        self.core.channel.events().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EmbedWarning, ProgressUpdate};
    use crate::model::HASHING_MODEL_ID;
    use crate::pipeline::{EmbeddingPipeline, HashingPipeline, factory_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails any batch larger than `limit`, otherwise embeds like the hashing model.
    struct LimitedPipeline {
        limit: usize,
        inner: HashingPipeline,
    }

    impl EmbeddingPipeline for LimitedPipeline {
        fn model_id(&self) -> &str {
            "limited"
        }
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
        fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.len() > self.limit {
                return Err(EmbedError::generation(format!(
                    "out of memory for {} texts",
                    texts.len()
                )));
            }
            self.inner.embed(texts)
        }
    }

    fn limited(limit: usize) -> PipelineFactory {
        factory_fn(move |_| {
            Ok(Box::new(LimitedPipeline {
                limit,
                inner: HashingPipeline::default(),
            }) as Box<dyn EmbeddingPipeline>)
        })
    }

    #[tokio::test]
    async fn test_not_ready_before_initialize() {
        let embedder = ThreadEmbedder::new(EmbedConfig::hashing());
        assert!(!embedder.is_ready());
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbedError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn test_hashing_round_trip() -> anyhow::Result<()> {
        let embedder = ThreadEmbedder::new(EmbedConfig::hashing());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let progress: ProgressCallback = Arc::new(move |_: &ProgressUpdate| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        embedder.initialize(Some(progress)).await?;
        assert!(embedder.is_ready());
        assert_eq!(embedder.dimensions(), 384);
        assert!(seen.load(Ordering::SeqCst) >= 1);

        let single = embedder.embed("rust embeddings").await?;
        let expected = HashingPipeline::default().embed_one("rust embeddings");
        assert_eq!(single, expected);

        let texts: Vec<String> = (0..40).map(|i| format!("text number {i}")).collect();
        let batch = embedder.embed_batch(&texts).await?;
        assert_eq!(batch.len(), 40);
        assert_eq!(batch[7], HashingPipeline::default().embed_one("text number 7"));

        let details = embedder.embed_with_details("abcdefgh").await?;
        assert_eq!(details.approximate_tokens, 2);
        assert_eq!(details.dimensions, 384);

        embedder.dispose().await?;
        assert!(!embedder.is_ready());
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_concurrent() -> anyhow::Result<()> {
        let embedder = Arc::new(ThreadEmbedder::new(EmbedConfig::hashing()));
        let (a, b) = tokio::join!(embedder.initialize(None), embedder.initialize(None));
        a?;
        b?;
        embedder.initialize(None).await?;
        assert!(embedder.is_ready());
        embedder.dispose().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_fallback_through_worker() -> anyhow::Result<()> {
        let config = EmbedConfig::hashing().with_batch_size(16);
        let embedder = ThreadEmbedder::with_factory(config, limited(3));
        let mut events = embedder.subscribe();
        embedder.initialize(None).await?;

        let texts: Vec<String> = (0..12).map(|i| format!("passage {i}")).collect();
        let vectors = embedder.embed_batch(&texts).await?;
        assert_eq!(vectors.len(), 12);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &HashingPipeline::default().embed_one(text));
        }
        assert!(embedder.batch_size() <= 3);

        let mut fallbacks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EmbedEvent::Warning(warning @ EmbedWarning::BatchSizeFallback { .. }) = event {
                assert_eq!(warning.kind(), "batch_size_fallback");
                fallbacks.push(warning);
            }
        }
        match fallbacks.first() {
            Some(EmbedWarning::BatchSizeFallback {
                previous_batch_size,
                new_batch_size,
                error,
            }) => {
                assert_eq!((*previous_batch_size, *new_batch_size), (16, 8));
                assert!(error.contains("out of memory for 12 texts"));
            }
            other => panic!("expected a fallback warning, got {other:?}"),
        }

        embedder.reset_batch_size();
        assert_eq!(embedder.batch_size(), 16);
        embedder.dispose().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_floor_failure_is_batch_exhausted() -> anyhow::Result<()> {
        let embedder = ThreadEmbedder::with_factory(EmbedConfig::hashing().with_batch_size(4), limited(0));
        embedder.initialize(None).await?;
        let texts: Vec<String> = vec!["a".into(), "b".into()];
        let err = embedder.embed_batch(&texts).await.unwrap_err();
        assert!(matches!(err, EmbedError::BatchExhausted { .. }));
        embedder.dispose().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_crash_rejects_and_flips_not_ready() -> anyhow::Result<()> {
        struct Crashing;
        impl EmbeddingPipeline for Crashing {
            fn model_id(&self) -> &str {
                "crashing"
            }
            fn dimensions(&self) -> usize {
                4
            }
            fn embed(&mut self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
                panic!("native code aborted")
            }
        }
        let factory = factory_fn(|_| Ok(Box::new(Crashing) as Box<dyn EmbeddingPipeline>));
        let embedder = ThreadEmbedder::with_factory(EmbedConfig::hashing(), factory);
        embedder.initialize(None).await?;
        assert_eq!(embedder.dimensions(), 4);

        let err = embedder.embed("anything").await.unwrap_err();
        assert!(matches!(err, EmbedError::WorkerCrashed { .. }));
        assert!(!embedder.is_ready());

        let err = embedder.embed("again").await.unwrap_err();
        assert!(matches!(err, EmbedError::NotInitialized { .. }));

        // Reinitializing brings up a fresh worker.
        embedder.initialize(None).await?;
        assert!(embedder.is_ready());
        embedder.dispose().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_abandons_request() -> anyhow::Result<()> {
        struct Slow;
        impl EmbeddingPipeline for Slow {
            fn model_id(&self) -> &str {
                "slow"
            }
            fn dimensions(&self) -> usize {
                1
            }
            fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(texts.iter().map(|_| vec![1.0]).collect())
            }
        }
        let config = EmbedConfig::hashing().with_request_timeout(Duration::from_millis(50));
        let factory = factory_fn(|_| Ok(Box::new(Slow) as Box<dyn EmbeddingPipeline>));
        let embedder = ThreadEmbedder::with_factory(config, factory);
        embedder.initialize(None).await?;

        let err = embedder.embed("late").await.unwrap_err();
        assert!(matches!(err, EmbedError::Timeout { .. }));
        // A timeout is not a crash.
        assert!(embedder.is_ready());

        embedder.dispose().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_init_failure_is_init_error() {
        let factory = factory_fn(|_| Err(EmbedError::init("weights missing")));
        let embedder = ThreadEmbedder::with_factory(EmbedConfig::hashing(), factory);
        let err = embedder.initialize(None).await.unwrap_err();
        assert!(matches!(err, EmbedError::Init { .. }));
        assert!(!embedder.is_ready());
    }

    #[test]
    fn test_capabilities_before_init() {
        let embedder = ThreadEmbedder::new(EmbedConfig::default());
        assert_eq!(embedder.model_id(), crate::model::DEFAULT_MODEL_ID);
        assert_eq!(embedder.dimensions(), 384);
        assert!(embedder.is_multilingual());
        assert_eq!(embedder.max_tokens(), 512);
        let hashing = ThreadEmbedder::new(EmbedConfig::hashing());
        assert_eq!(hashing.name(), HASHING_MODEL_ID);
        assert_eq!(hashing.priority(), 0);
    }
}
