//! Progress and warning events emitted by embedders.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of each embedder's event channel. Slow subscribers lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A model loading progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// `loading`, `downloading` or `ready`
    pub stage: String,
    /// Percentage in 0..=100
    pub progress: f32,
    pub message: String,
}

impl ProgressUpdate {
    pub fn new(stage: impl Into<String>, progress: f32, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            progress: progress.clamp(0.0, 100.0),
            message: message.into(),
        }
    }
}

/// Non-fatal conditions worth surfacing to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbedWarning {
    /// Adaptive fallback halved the working batch size.
    BatchSizeFallback {
        previous_batch_size: usize,
        new_batch_size: usize,
        error: String,
    },
    /// Free-form warning relayed from a worker.
    Worker { message: String },
}

impl EmbedWarning {
    pub fn kind(&self) -> &'static str {
        match self {
            EmbedWarning::BatchSizeFallback { .. } => "batch_size_fallback",
            EmbedWarning::Worker { .. } => "worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmbedEvent {
    Progress(ProgressUpdate),
    Warning(EmbedWarning),
}

/// Callback handed to `initialize` for model loading progress.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

pub(crate) fn event_channel() -> broadcast::Sender<EmbedEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Broadcast an event. Having no subscribers is normal and not an error.
pub(crate) fn emit(events: &broadcast::Sender<EmbedEvent>, event: EmbedEvent) {
    let _ = events.send(event);
}
