use anyhow::Result;
use futures::TryStreamExt;
use quarry_embed::{
    EmbedConfig, EmbedError, EmbedEvent, EmbedWarning, Embedder, EmbedderRegistry,
    EmbeddingProvider, SubprocessConfig, SubprocessEmbedder, ThreadEmbedder,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn worker_config() -> SubprocessConfig {
    SubprocessConfig::default()
        .with_program(env!("CARGO_BIN_EXE_quarry-embed-worker"))
        .with_shutdown_grace(Duration::from_secs(2))
}

fn texts(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("passage number {i} about rust")).collect()
}

/// Stand-in worker in POSIX sh. Answers `init` with two dimensions, embeds
/// batches of at most two texts as `[1, 0]` and reports larger batches as out
/// of memory. Any other request makes it exit with status 1. Every start
/// appends a line to the file named by `$1`.
const STAND_IN_WORKER: &str = r##"
echo start >> "$1"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"type":"init"'*)
      printf '{"type":"ready","id":"%s","dimensions":2,"model":"stand-in","quantization":"q8"}\n' "$id" ;;
    *'"type":"embed_batch'*)
      quotes=$(printf '%s\n' "$line" | sed 's/.*"texts":\[//' | tr -cd '"' | wc -c)
      count=$((quotes / 2))
      if [ "$count" -gt 2 ]; then
        printf '{"type":"error","id":"%s","message":"out of memory for %s texts"}\n' "$id" "$count"
      else
        vectors=""
        i=0
        while [ "$i" -lt "$count" ]; do
          vectors="$vectors${vectors:+,}[1.0,0.0]"
          i=$((i + 1))
        done
        printf '{"type":"embeddings","id":"%s","embeddings":[%s]}\n' "$id" "$vectors"
      fi ;;
    *'"type":"shutdown"'*) exit 0 ;;
    *) exit 1 ;;
  esac
done
"##;

fn stand_in_config(starts: &Path) -> SubprocessConfig {
    let mut process = SubprocessConfig::default()
        .with_program("sh")
        .with_shutdown_grace(Duration::from_secs(2));
    process.args = vec![
        "-c".into(),
        STAND_IN_WORKER.into(),
        "stand-in-worker".into(),
        starts.display().to_string(),
    ];
    process
}

fn start_count(starts: &Path) -> Result<usize> {
    Ok(std::fs::read_to_string(starts)?.lines().count())
}

#[tokio::test]
async fn test_subprocess_round_trip() -> Result<()> {
    let embedder = SubprocessEmbedder::new(EmbedConfig::hashing(), worker_config());

    let progress_calls = Arc::new(AtomicUsize::new(0));
    let counter = progress_calls.clone();
    embedder
        .initialize(Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .await?;

    assert!(embedder.is_ready());
    assert_eq!(embedder.dimensions(), 384);
    assert!(progress_calls.load(Ordering::SeqCst) >= 1);

    let single = embedder.embed("hello world").await?;
    assert_eq!(single.len(), 384);

    let batch = embedder.embed_batch(&texts(5)).await?;
    assert_eq!(batch.len(), 5);

    let details = embedder.embed_with_details("abcdefgh").await?;
    assert_eq!(details.approximate_tokens, 2);
    assert_eq!(details.model_id, "hashing");

    embedder.dispose().await?;
    assert!(!embedder.is_ready());
    Ok(())
}

#[tokio::test]
async fn test_subprocess_matches_thread_executor() -> Result<()> {
    let subprocess = SubprocessEmbedder::new(EmbedConfig::hashing(), worker_config());
    let thread = ThreadEmbedder::new(EmbedConfig::hashing());
    subprocess.initialize(None).await?;
    thread.initialize(None).await?;

    let inputs = texts(7);
    assert_eq!(
        subprocess.embed_batch_documents(&inputs).await?,
        thread.embed_batch_documents(&inputs).await?
    );
    assert_eq!(
        subprocess.embed_query("rust ownership").await?,
        thread.embed_query("rust ownership").await?
    );

    subprocess.dispose().await?;
    thread.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn test_streaming_yields_per_sub_batch() -> Result<()> {
    let embedder =
        SubprocessEmbedder::new(EmbedConfig::hashing().with_batch_size(4), worker_config());
    embedder.initialize(None).await?;

    let inputs = texts(10);
    let chunks: Vec<Vec<Vec<f32>>> = embedder
        .embed_documents_stream(inputs.clone())
        .try_collect()
        .await?;

    assert_eq!(
        chunks.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![4, 4, 2]
    );
    let flattened: Vec<Vec<f32>> = chunks.into_iter().flatten().collect();
    assert_eq!(flattened, embedder.embed_batch_documents(&inputs).await?);

    embedder.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn test_requests_after_dispose_fail() -> Result<()> {
    let embedder = SubprocessEmbedder::new(EmbedConfig::hashing(), worker_config());
    embedder.initialize(None).await?;
    embedder.dispose().await?;

    let err = embedder.embed("late").await.unwrap_err();
    assert!(matches!(err, EmbedError::NotInitialized { .. }));

    // A disposed embedder can be brought back.
    embedder.initialize(None).await?;
    assert_eq!(embedder.embed("again").await?.len(), 384);
    embedder.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn test_registry_serves_subprocess_embedder() -> Result<()> {
    let registry = Arc::new(EmbedderRegistry::new());
    registry.register(Arc::new(ThreadEmbedder::new(
        EmbedConfig::hashing().with_name("thread").with_priority(1),
    )));
    registry.register(Arc::new(SubprocessEmbedder::new(
        EmbedConfig::hashing().with_name("isolated").with_priority(5),
        worker_config(),
    )));
    assert_eq!(registry.default_name().as_deref(), Some("isolated"));

    let provider = registry.indexing_provider();
    let result = provider.embed_texts(&texts(3)).await?;
    assert_eq!(result.len(), 3);
    assert!(registry.get("isolated").is_some_and(|e| e.is_ready()));
    assert!(registry.get("thread").is_some_and(|e| !e.is_ready()));

    registry.dispose_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_worker_exit_fails_pending_request_and_restarts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let starts = dir.path().join("starts");
    let embedder = SubprocessEmbedder::new(EmbedConfig::hashing(), stand_in_config(&starts));
    embedder.initialize(None).await?;
    assert_eq!(embedder.dimensions(), 2);
    assert_eq!(start_count(&starts)?, 1);

    // The stand-in exits on a single-text request while it is pending.
    let err = embedder.embed("anything").await.unwrap_err();
    assert!(matches!(err, EmbedError::WorkerCrashed { .. }), "{err:?}");
    assert!(!embedder.is_ready());

    let err = embedder.embed("again").await.unwrap_err();
    assert!(matches!(err, EmbedError::NotInitialized { .. }), "{err:?}");

    embedder.initialize(None).await?;
    assert!(embedder.is_ready());
    assert_eq!(start_count(&starts)?, 2, "a fresh worker process was started");
    let vectors = embedder.embed_batch(&texts(2)).await?;
    assert_eq!(vectors, vec![vec![1.0, 0.0]; 2]);

    embedder.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn test_batch_fallback_through_subprocess() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let embedder = SubprocessEmbedder::new(
        EmbedConfig::hashing().with_batch_size(8),
        stand_in_config(&dir.path().join("starts")),
    );
    let mut events = embedder.subscribe();
    embedder.initialize(None).await?;

    let vectors = embedder.embed_batch_documents(&texts(5)).await?;
    assert_eq!(vectors, vec![vec![1.0, 0.0]; 5]);
    assert_eq!(embedder.batch_size(), 2);
    assert!(embedder.is_ready(), "generation errors leave the worker running");

    let mut fallbacks = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EmbedEvent::Warning(EmbedWarning::BatchSizeFallback {
            previous_batch_size,
            new_batch_size,
            error,
        }) = event
        {
            assert!(error.contains("out of memory"), "{error}");
            fallbacks.push((previous_batch_size, new_batch_size));
        }
    }
    assert_eq!(fallbacks.first(), Some(&(8, 4)));
    assert_eq!(fallbacks.last(), Some(&(4, 2)));

    embedder.reset_batch_size();
    assert_eq!(embedder.batch_size(), 8);
    embedder.dispose().await?;
    Ok(())
}
