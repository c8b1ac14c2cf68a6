//! Out-of-line embedder executors.
//!
//! Both executors keep inference away from the caller's runtime and speak the
//! same [`protocol`](crate::protocol) to a [`WorkerSession`](crate::worker::WorkerSession):
//!
//! ```text
//!            ┌──────────────── RequestChannel ────────────────┐
//! caller ──▶ │ id → oneshot  (pending map)   timeout per call  │ ──▶ worker
//!        ◀── │ reader task: settle by id / forward progress    │ ◀──
//!            └─────────────────────────────────────────────────┘
//! ```
//!
//! - [`ThreadEmbedder`]: a dedicated OS thread, fed through `flume` channels
//! - [`SubprocessEmbedder`]: the `quarry-embed-worker` binary, fed JSON lines over stdio
//!
//! A timed-out request is abandoned, not cancelled: the worker finishes it and
//! the late answer is dropped with a debug log.

mod subprocess;
mod thread;

pub use subprocess::SubprocessEmbedder;
pub use thread::ThreadEmbedder;

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::events::{EmbedEvent, EmbedWarning, ProgressCallback, ProgressUpdate, emit, event_channel};
use crate::fallback::AdaptiveBatchSize;
use crate::model::ModelSpec;
use crate::protocol::{Request, Response};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, warn};

type Pending = HashMap<String, oneshot::Sender<Result<Response>>>;

/// Correlates requests with responses for one executor.
#[derive(Clone)]
pub(crate) struct RequestChannel {
    inner: Arc<ChannelState>,
}

struct ChannelState {
    label: String,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    ready: AtomicBool,
    progress: Mutex<Option<ProgressCallback>>,
    events: broadcast::Sender<EmbedEvent>,
}

impl RequestChannel {
    pub fn new(label: impl Into<String>, events: broadcast::Sender<EmbedEvent>) -> Self {
        Self {
            inner: Arc::new(ChannelState {
                label: label.into(),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                ready: AtomicBool::new(false),
                progress: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn events(&self) -> &broadcast::Sender<EmbedEvent> {
        &self.inner.events
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        *lock(&self.inner.progress) = callback;
    }

    pub fn next_request_id(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{n}", self.inner.label)
    }

    /// Register interest in the response to `id`. Must happen before the request is sent.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Result<Response>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.to_string(), tx);
        rx
    }

    pub fn forget(&self, id: &str) {
        lock(&self.inner.pending).remove(id);
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Wait for the response to `id`, giving up after `timeout`.
    pub async fn wait(
        &self,
        id: &str,
        operation: &str,
        rx: oneshot::Receiver<Result<Response>>,
        timeout: Duration,
    ) -> Result<Response> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EmbedError::worker_crashed(format!(
                "{} dropped request {id}",
                self.inner.label
            ))),
            Err(_) => {
                self.forget(id);
                warn!(request_id = %id, "Embedding request {operation} timed out after {timeout:?}");
                Err(EmbedError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Route one message from the worker.
    ///
    /// Returns `false` when the worker announced it is going away.
    pub fn dispatch(&self, response: Response) -> bool {
        match response {
            Response::Progress {
                stage,
                progress,
                message,
            } => {
                let update = ProgressUpdate::new(stage, progress, message);
                let callback = lock(&self.inner.progress).clone();
                if let Some(callback) = callback {
                    callback(&update);
                }
                emit(&self.inner.events, EmbedEvent::Progress(update));
                true
            }
            Response::Warning { message } => {
                warn!("{}: {message}", self.inner.label);
                emit(
                    &self.inner.events,
                    EmbedEvent::Warning(EmbedWarning::Worker { message }),
                );
                true
            }
            Response::Fatal { message } => {
                self.fail_all(&message);
                false
            }
            Response::Unknown => {
                debug!("{} ignored an unknown message type", self.inner.label);
                true
            }
            Response::Error { id: None, message, .. } => {
                warn!("{} reported an error outside any request: {message}", self.inner.label);
                true
            }
            settled => {
                let Some(id) = settled.request_id().map(str::to_string) else {
                    return true;
                };
                match lock(&self.inner.pending).remove(&id) {
                    Some(tx) => {
                        let result = match settled {
                            Response::Error { kind, message, .. } => Err(kind.into_error(message)),
                            other => Ok(other),
                        };
                        // The caller may have stopped waiting in the meantime.
                        let _ = tx.send(result);
                    }
                    None => debug!(
                        request_id = %id,
                        "Dropping late response from {}", self.inner.label
                    ),
                }
                true
            }
        }
    }

    /// Reject every pending request and mark the executor not ready.
    pub fn fail_all(&self, reason: &str) {
        self.set_ready(false);
        let drained: Vec<_> = lock(&self.inner.pending).drain().collect();
        if !drained.is_empty() {
            error!(
                "{} failed with {} pending requests: {reason}",
                self.inner.label,
                drained.len()
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(EmbedError::worker_crashed(reason.to_string())));
        }
    }
}

/// Sends requests to a worker. Implemented by each executor's link.
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<()>;
}

/// State and request logic shared by both executors.
pub(crate) struct ExecutorCore {
    pub config: EmbedConfig,
    pub spec: ModelSpec,
    pub channel: RequestChannel,
    pub batch: AdaptiveBatchSize,
    dimensions: AtomicUsize,
}

impl ExecutorCore {
    pub fn new(config: EmbedConfig, label: &str) -> Self {
        let spec = ModelSpec::for_model(&config.model_id);
        Self {
            dimensions: AtomicUsize::new(spec.dimensions),
            batch: AdaptiveBatchSize::new(config.batch_size),
            channel: RequestChannel::new(format!("{label}:{}", config.name), event_channel()),
            spec,
            config,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::SeqCst)
    }

    pub fn not_initialized(&self) -> EmbedError {
        EmbedError::NotInitialized {
            name: self.config.name.clone(),
        }
    }

    /// Send one request and wait for its response.
    pub async fn call<T: Transport + ?Sized>(
        &self,
        transport: &T,
        build: impl FnOnce(String) -> Request,
        timeout: Duration,
    ) -> Result<Response> {
        let id = self.channel.next_request_id();
        let request = build(id.clone());
        let operation = request.operation();
        let rx = self.channel.register(&id);
        if let Err(e) = transport.send(request).await {
            self.channel.forget(&id);
            return Err(e);
        }
        self.channel.wait(&id, operation, rx, timeout).await
    }

    /// Load the model in the worker and wait for `ready`.
    pub async fn handshake<T: Transport + ?Sized>(&self, transport: &T) -> Result<()> {
        let response = self
            .call(
                transport,
                |id| Request::Init {
                    id,
                    model: self.config.model_id.clone(),
                    quantization: self.config.quantization,
                    cache_dir: self.config.cache_dir.clone(),
                    batch_size: self.config.batch_size,
                },
                self.config.init_timeout,
            )
            .await
            .map_err(|e| match e {
                EmbedError::Generation { message } => EmbedError::init(message),
                other => other,
            })?;

        match response {
            Response::Ready { dimensions, .. } => {
                self.dimensions.store(dimensions, Ordering::SeqCst);
                self.channel.set_ready(true);
                Ok(())
            }
            other => Err(EmbedError::init(format!("unexpected init response {other:?}"))),
        }
    }

    pub async fn embed_one<T: Transport + ?Sized>(
        &self,
        transport: &T,
        build: impl FnOnce(String) -> Request,
    ) -> Result<Vec<f32>> {
        self.call(transport, build, self.config.request_timeout)
            .await?
            .into_embedding()
    }

    /// Batch embedding with adaptive fallback. `documents` selects passage prefixes.
    pub async fn embed_many<T: Transport + ?Sized>(
        &self,
        transport: &T,
        texts: &[String],
        documents: bool,
    ) -> Result<Vec<Vec<f32>>> {
        let timeout = self.config.request_timeout;
        self.batch
            .run(texts, self.channel.events(), |batch| async move {
                self.call(
                    transport,
                    |id| {
                        if documents {
                            Request::EmbedBatchDocuments { id, texts: batch }
                        } else {
                            Request::EmbedBatch { id, texts: batch }
                        }
                    },
                    timeout,
                )
                .await?
                .into_embeddings()
            })
            .await
    }
}

/// Poisoning only means another thread panicked while holding the lock; the map is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
