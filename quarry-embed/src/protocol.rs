//! Messages exchanged between an executor and its worker.
//!
//! The subprocess executor sends these as one JSON object per line; the thread
//! executor passes the same values over channels. Every request carries an id
//! that the matching response echoes. `progress`, `warning` and any message
//! type this build does not know never resolve a pending request.
//!
//! ```text
//! → {"type":"init","id":"w-1","model":"Xenova/multilingual-e5-small","quantization":"q8","batch_size":16}
//! ← {"type":"progress","stage":"downloading","progress":60.0,"message":"model weights ready"}
//! ← {"type":"ready","id":"w-1","dimensions":384,"model":"Xenova/multilingual-e5-small","quantization":"q8"}
//! → {"type":"embed_query","id":"w-2","text":"how are vectors stored?"}
//! ← {"type":"embedding","id":"w-2","embedding":[0.01, ...]}
//! ```

use crate::error::{EmbedError, Result};
use crate::model::Quantization;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Init {
        id: String,
        model: String,
        #[serde(default)]
        quantization: Quantization,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_dir: Option<PathBuf>,
        #[serde(default = "default_batch_size")]
        batch_size: usize,
    },
    Embed {
        id: String,
        text: String,
    },
    EmbedBatch {
        id: String,
        texts: Vec<String>,
    },
    EmbedQuery {
        id: String,
        text: String,
    },
    EmbedDocument {
        id: String,
        text: String,
    },
    EmbedBatchDocuments {
        id: String,
        texts: Vec<String>,
    },
    Shutdown,
}

fn default_batch_size() -> usize {
    16
}

impl Request {
    pub fn id(&self) -> Option<&str> {
        match self {
            Request::Init { id, .. }
            | Request::Embed { id, .. }
            | Request::EmbedBatch { id, .. }
            | Request::EmbedQuery { id, .. }
            | Request::EmbedDocument { id, .. }
            | Request::EmbedBatchDocuments { id, .. } => Some(id),
            Request::Shutdown => None,
        }
    }

    /// Name used in timeout errors and logs.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Init { .. } => "init",
            Request::Embed { .. } => "embed",
            Request::EmbedBatch { .. } => "embed_batch",
            Request::EmbedQuery { .. } => "embed_query",
            Request::EmbedDocument { .. } => "embed_document",
            Request::EmbedBatchDocuments { .. } => "embed_batch_documents",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready {
        id: String,
        dimensions: usize,
        model: String,
        quantization: Quantization,
    },
    Embedding {
        id: String,
        embedding: Vec<f32>,
    },
    Embeddings {
        id: String,
        embeddings: Vec<Vec<f32>>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "ErrorKind::is_generation")]
        kind: ErrorKind,
        message: String,
    },
    Progress {
        stage: String,
        progress: f32,
        #[serde(default)]
        message: String,
    },
    Warning {
        message: String,
    },
    /// The worker is about to exit and will answer nothing else.
    Fatal {
        message: String,
    },
    /// Any message type this build does not understand.
    #[serde(other)]
    Unknown,
}

/// What went wrong with a request, as far as the worker can tell.
///
/// Workers that predate this field send no `kind`; those errors are read as
/// generation failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    Generation,
    /// The worker has no model loaded.
    NotInitialized,
}

impl ErrorKind {
    fn is_generation(&self) -> bool {
        *self == ErrorKind::Generation
    }

    pub fn of(error: &EmbedError) -> Self {
        match error {
            EmbedError::NotInitialized { .. } => ErrorKind::NotInitialized,
            _ => ErrorKind::Generation,
        }
    }

    /// Turn a worker-reported failure into the executor-side error.
    ///
    /// Executors only send embedding requests after a successful handshake,
    /// so a worker without a model is out of step with its executor.
    pub fn into_error(self, message: String) -> EmbedError {
        match self {
            ErrorKind::Generation => EmbedError::generation(message),
            ErrorKind::NotInitialized => {
                EmbedError::protocol(format!("worker has no model loaded: {message}"))
            }
        }
    }
}

impl Response {
    /// Id of the request this response settles, if it settles one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Response::Ready { id, .. }
            | Response::Embedding { id, .. }
            | Response::Embeddings { id, .. } => Some(id),
            Response::Error { id, .. } => id.as_deref(),
            Response::Progress { .. }
            | Response::Warning { .. }
            | Response::Fatal { .. }
            | Response::Unknown => None,
        }
    }

    pub fn into_embedding(self) -> Result<Vec<f32>> {
        match self {
            Response::Embedding { embedding, .. } => Ok(embedding),
            Response::Error { kind, message, .. } => Err(kind.into_error(message)),
            other => Err(unexpected("embedding", &other)),
        }
    }

    pub fn into_embeddings(self) -> Result<Vec<Vec<f32>>> {
        match self {
            Response::Embeddings { embeddings, .. } => Ok(embeddings),
            Response::Error { kind, message, .. } => Err(kind.into_error(message)),
            other => Err(unexpected("embeddings", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> EmbedError {
    EmbedError::protocol(format!("expected `{expected}` response, got {got:?}"))
}

/// Encode a message as one protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
