//! The worker side of the protocol.
//!
//! [`WorkerSession`] owns a pipeline and answers [`Request`]s. The thread
//! executor runs it on a dedicated thread; the `quarry-embed-worker` binary
//! runs it behind stdin/stdout. Sharing the session is what makes both
//! executors produce identical vectors for the same model.

use crate::error::EmbedError;
use crate::events::ProgressUpdate;
use crate::model::{ModelSpec, clean_text};
use crate::pipeline::{EmbeddingPipeline, PipelineFactory, PipelineParams};
use crate::protocol::{ErrorKind, Request, Response};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, info};

/// Whether the worker loop should keep reading requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct WorkerSession {
    factory: PipelineFactory,
    loaded: Option<Loaded>,
}

struct Loaded {
    spec: ModelSpec,
    pipeline: Box<dyn EmbeddingPipeline>,
}

impl WorkerSession {
    pub fn new(factory: PipelineFactory) -> Self {
        Self {
            factory,
            loaded: None,
        }
    }

    /// Answer one request, sending every response through `emit`.
    ///
    /// A panic inside the pipeline is turned into a `fatal` response and stops
    /// the session, since the pipeline state can no longer be trusted.
    pub fn handle(&mut self, request: Request, emit: &mut dyn FnMut(Response)) -> Flow {
        if request == Request::Shutdown {
            info!("Embedding worker shutting down");
            return Flow::Stop;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(request, &mut *emit)));
        match outcome {
            Ok(()) => Flow::Continue,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "pipeline panicked".to_string());
                self.loaded = None;
                emit(Response::Fatal { message });
                Flow::Stop
            }
        }
    }

    fn dispatch(&mut self, request: Request, emit: &mut dyn FnMut(Response)) {
        match request {
            Request::Init {
                id,
                model,
                quantization,
                cache_dir,
                batch_size,
            } => {
                let params = PipelineParams {
                    model_id: model.clone(),
                    quantization,
                    cache_dir,
                    batch_size,
                };
                let loaded = {
                    let mut on_progress = |update: ProgressUpdate| {
                        emit(Response::Progress {
                            stage: update.stage,
                            progress: update.progress,
                            message: update.message,
                        })
                    };
                    (self.factory)(&params, &mut on_progress)
                };
                match loaded {
                    Ok(pipeline) => {
                        let dimensions = pipeline.dimensions();
                        info!("Loaded embedding model {model} ({dimensions} dimensions)");
                        self.loaded = Some(Loaded {
                            spec: ModelSpec::for_model(&model),
                            pipeline,
                        });
                        emit(Response::Ready {
                            id,
                            dimensions,
                            model,
                            quantization,
                        });
                    }
                    Err(e) => emit(error_response(id, &e)),
                }
            }
            Request::Embed { id, text } => {
                let result = self.embed_texts(vec![text], |_, t| t.to_string());
                emit(single(id, result));
            }
            Request::EmbedQuery { id, text } => {
                let result = self.embed_texts(vec![text], |spec, t| spec.query_text(t));
                emit(single(id, result));
            }
            Request::EmbedDocument { id, text } => {
                let result = self.embed_texts(vec![text], |spec, t| spec.passage_text(t));
                emit(single(id, result));
            }
            Request::EmbedBatch { id, texts } => {
                let result = self.embed_texts(texts, |_, t| t.to_string());
                emit(many(id, result));
            }
            Request::EmbedBatchDocuments { id, texts } => {
                let result = self.embed_texts(texts, |spec, t| spec.passage_text(t));
                emit(many(id, result));
            }
            Request::Shutdown => {}
        }
    }

    fn embed_texts(
        &mut self,
        texts: Vec<String>,
        prepare: impl Fn(&ModelSpec, &str) -> String,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| EmbedError::NotInitialized {
                name: "worker".into(),
            })?;
        let prepared: Vec<String> = texts
            .iter()
            .map(|t| prepare(&loaded.spec, &clean_text(t)))
            .collect();
        debug!("Embedding {} texts", prepared.len());
        loaded.pipeline.embed(&prepared)
    }
}

fn error_response(id: String, error: &EmbedError) -> Response {
    Response::Error {
        id: Some(id),
        kind: ErrorKind::of(error),
        message: error.to_string(),
    }
}

fn single(id: String, result: Result<Vec<Vec<f32>>, EmbedError>) -> Response {
    match result.map(|mut v| v.pop()) {
        Ok(Some(embedding)) => Response::Embedding { id, embedding },
        Ok(None) => error_response(id, &EmbedError::generation("pipeline returned no vector")),
        Err(e) => error_response(id, &e),
    }
}

fn many(id: String, result: Result<Vec<Vec<f32>>, EmbedError>) -> Response {
    match result {
        Ok(embeddings) => Response::Embeddings { id, embeddings },
        Err(e) => error_response(id, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HASHING_MODEL_ID, Quantization};
    use crate::pipeline::{HashingPipeline, default_factory, factory_fn};

    fn run(session: &mut WorkerSession, request: Request) -> (Vec<Response>, Flow) {
        let mut out = Vec::new();
        let flow = session.handle(request, &mut |r| out.push(r));
        (out, flow)
    }

    fn init(model: &str) -> Request {
        Request::Init {
            id: "i".into(),
            model: model.into(),
            quantization: Quantization::Q8,
            cache_dir: None,
            batch_size: 4,
        }
    }

    #[test]
    fn test_requests_before_init_fail() {
        let mut session = WorkerSession::new(default_factory());
        let (out, flow) = run(
            &mut session,
            Request::Embed {
                id: "1".into(),
                text: "hi".into(),
            },
        );
        assert_eq!(flow, Flow::Continue);
        match &out[0] {
            Response::Error { id, kind, message } => {
                assert_eq!(id.as_deref(), Some("1"));
                assert_eq!(*kind, ErrorKind::NotInitialized);
                assert!(message.contains("not initialized"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_uninitialized_batch_is_not_retried_smaller() {
        let mut session = WorkerSession::new(default_factory());
        let (mut out, _) = run(
            &mut session,
            Request::EmbedBatchDocuments {
                id: "2".into(),
                texts: vec!["a".into(), "b".into()],
            },
        );
        let err = out.remove(0).into_embeddings().unwrap_err();
        assert!(matches!(err, EmbedError::Protocol { .. }));
        assert!(!err.allows_batch_fallback());
    }

    #[test]
    fn test_init_reports_progress_then_ready() {
        let mut session = WorkerSession::new(default_factory());
        let (out, _) = run(&mut session, init(HASHING_MODEL_ID));
        assert!(matches!(out.first(), Some(Response::Progress { .. })));
        assert!(matches!(
            out.last(),
            Some(Response::Ready { dimensions: 384, .. })
        ));
    }

    #[test]
    fn test_texts_are_cleaned_before_embedding() {
        let mut session = WorkerSession::new(default_factory());
        run(&mut session, init(HASHING_MODEL_ID));

        let (out, _) = run(
            &mut session,
            Request::EmbedBatch {
                id: "b".into(),
                texts: vec!["hello\u{0}\nworld".into()],
            },
        );
        let expected = HashingPipeline::default().embed_one("hello world");
        assert_eq!(
            out,
            vec![Response::Embeddings {
                id: "b".into(),
                embeddings: vec![expected],
            }]
        );
    }

    #[test]
    fn test_e5_prefixes_applied_to_queries() {
        // A pipeline that echoes the prepared text length lets us see the prefix.
        struct LengthPipeline;
        impl EmbeddingPipeline for LengthPipeline {
            fn model_id(&self) -> &str {
                "test/e5-small"
            }
            fn dimensions(&self) -> usize {
                1
            }
            fn embed(&mut self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
            }
        }
        let factory = factory_fn(|_| Ok(Box::new(LengthPipeline) as Box<dyn EmbeddingPipeline>));
        let mut session = WorkerSession::new(factory);
        run(&mut session, init("test/e5-small"));

        let (query, _) = run(
            &mut session,
            Request::EmbedQuery {
                id: "q".into(),
                text: "abc".into(),
            },
        );
        let (doc, _) = run(
            &mut session,
            Request::EmbedDocument {
                id: "d".into(),
                text: "abc".into(),
            },
        );
        let (plain, _) = run(
            &mut session,
            Request::Embed {
                id: "p".into(),
                text: "abc".into(),
            },
        );
        assert_eq!(query[0].clone().into_embedding().unwrap(), vec![10.0]);
        assert_eq!(doc[0].clone().into_embedding().unwrap(), vec![12.0]);
        assert_eq!(plain[0].clone().into_embedding().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_pipeline_panic_becomes_fatal() {
        struct PanickingPipeline;
        impl EmbeddingPipeline for PanickingPipeline {
            fn model_id(&self) -> &str {
                "panics"
            }
            fn dimensions(&self) -> usize {
                1
            }
            fn embed(&mut self, _texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
                panic!("onnx runtime exploded")
            }
        }
        let factory =
            factory_fn(|_| Ok(Box::new(PanickingPipeline) as Box<dyn EmbeddingPipeline>));
        let mut session = WorkerSession::new(factory);
        run(&mut session, init("panics"));

        let (out, flow) = run(
            &mut session,
            Request::Embed {
                id: "x".into(),
                text: "boom".into(),
            },
        );
        assert_eq!(flow, Flow::Stop);
        assert_eq!(
            out,
            vec![Response::Fatal {
                message: "onnx runtime exploded".into()
            }]
        );
    }

    #[test]
    fn test_shutdown_stops() {
        let mut session = WorkerSession::new(default_factory());
        let (out, flow) = run(&mut session, Request::Shutdown);
        assert!(out.is_empty());
        assert_eq!(flow, Flow::Stop);
    }
}
