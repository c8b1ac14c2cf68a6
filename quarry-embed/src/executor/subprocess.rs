//! Embedder running its pipeline in a separate process.
//!
//! The child is the `quarry-embed-worker` binary (or anything speaking the same
//! line protocol). Requests go to its stdin as JSON lines, responses come back
//! on stdout, and stderr is relayed to `tracing` at debug level.

use super::{ExecutorCore, RequestChannel, Transport};
use crate::config::{EmbedConfig, SubprocessConfig, WORKER_PROGRAM_ENV};
use crate::error::{EmbedError, Result};
use crate::events::{EmbedEvent, ProgressCallback};
use crate::protocol::{Request, Response, encode_line};
use crate::provider::Embedder;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

/// Runs the embedding worker as a child process.
///
/// Produces the same vectors as [`ThreadEmbedder`](super::ThreadEmbedder) for
/// the same model and quantization, so the two can be swapped freely. Use this
/// one when a native crash in the model runtime must not take the host down.
pub struct SubprocessEmbedder {
    core: ExecutorCore,
    process: SubprocessConfig,
    link: Mutex<Option<Arc<ProcessLink>>>,
}

struct ProcessLink {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    stopping: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
    stderr: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Transport for ProcessLink {
    async fn send(&self, request: Request) -> Result<()> {
        let line = encode_line(&request)?;
        let mut stdin = self.stdin.lock().await;
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|e| EmbedError::worker_crashed(format!("cannot write to embedding worker: {e}")))
    }
}

impl ProcessLink {
    fn spawn(config: &SubprocessConfig, channel: RequestChannel) -> Result<Self> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EmbedError::init(format!(
                    "embedding worker `{}` not found; install it with `cargo install --path quarry-embed` \
                     or point {WORKER_PROGRAM_ENV} at the binary",
                    config.program.display()
                ))
            } else {
                EmbedError::init(format!(
                    "cannot start embedding worker `{}`: {e}",
                    config.program.display()
                ))
            }
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(EmbedError::init("embedding worker started without piped stdio"));
        };

        let stopping = Arc::new(AtomicBool::new(false));
        let reader_stopping = stopping.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Response>(&line) {
                            Ok(response) => {
                                if !channel.dispatch(response) {
                                    break;
                                }
                            }
                            Err(e) => warn!("Ignoring malformed line from embedding worker: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read from embedding worker: {e}");
                        break;
                    }
                }
            }
            if !reader_stopping.load(Ordering::SeqCst) && channel.is_ready() {
                error!("Embedding worker process exited unexpectedly");
            }
            channel.fail_all("embedding worker process exited");
        });

        let stderr = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "quarry_embed::worker_stderr", "{line}");
            }
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            stopping,
            reader,
            stderr,
        })
    }

    /// Send `shutdown`, give the child `grace` to exit, then kill it.
    async fn shutdown(&self, grace: std::time::Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.send(Request::Shutdown).await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Embedding worker exited with {status}"),
            Ok(Err(e)) => warn!("Could not wait for embedding worker: {e}"),
            Err(_) => {
                warn!("Embedding worker ignored shutdown for {grace:?}, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Could not kill embedding worker: {e}");
                }
            }
        }
        self.reader.abort();
        self.stderr.abort();
    }
}

impl SubprocessEmbedder {
    pub fn new(config: EmbedConfig, process: SubprocessConfig) -> Self {
        Self {
            core: ExecutorCore::new(config, "subprocess"),
            process,
            link: Mutex::new(None),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.core.batch.current()
    }

    pub fn reset_batch_size(&self) {
        self.core.batch.reset();
    }

    async fn live_link(&self) -> Result<Arc<ProcessLink>> {
        if !self.core.channel.is_ready() {
            return Err(self.core.not_initialized());
        }
        self.link
            .lock()
            .await
            .clone()
            .ok_or_else(|| self.core.not_initialized())
    }

    /// Embed passages one sub-batch at a time.
    ///
    /// Each item holds the vectors of the next `batch_size()` texts, so a large
    /// indexing job never holds more than one sub-batch of vectors in memory.
    /// Adaptive fallback applies per sub-batch; a shrunken batch size also
    /// shrinks the following sub-batches.
    pub fn embed_documents_stream(
        &self,
        texts: Vec<String>,
    ) -> BoxStream<'_, Result<Vec<Vec<f32>>>> {
        stream::try_unfold((texts, 0usize), move |(texts, offset)| async move {
            if offset >= texts.len() {
                return Ok(None);
            }
            let end = (offset + self.core.batch.current()).min(texts.len());
            let vectors = self.embed_batch_documents(&texts[offset..end]).await?;
            Ok(Some((vectors, (texts, end))))
        })
        .boxed()
    }
}

#[async_trait]
impl Embedder for SubprocessEmbedder {
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
            stale.shutdown(self.process.shutdown_grace).await;
        }

        info!(
            "Starting embedding worker {} for {}",
            self.process.program.display(),
            self.core.config.model_id
        );
        self.core.channel.set_progress_callback(progress);
        let fresh = Arc::new(ProcessLink::spawn(&self.process, self.core.channel.clone())?);

        let outcome = self.core.handshake(fresh.as_ref()).await;
        self.core.channel.set_progress_callback(None);
        match outcome {
            Ok(()) => {
                *link = Some(fresh);
                Ok(())
            }
            Err(e) => {
                fresh.shutdown(self.process.shutdown_grace).await;
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
            current.shutdown(self.process.shutdown_grace).await;
        }
        self.core.channel.fail_all("embedder disposed");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EmbedEvent> {
        self.core.channel.events().subscribe()
    }
}
