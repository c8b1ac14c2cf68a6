//! Synchronous inference pipelines run inside a worker.
//!
//! A pipeline turns cleaned, already-prefixed texts into normalized vectors. It
//! is blocking by nature and lives on the worker thread or in the worker
//! subprocess, never on the async runtime.

mod hashing;
mod onnx;

pub use hashing::HashingPipeline;
pub use onnx::OnnxPipeline;

use crate::error::Result;
use crate::events::ProgressUpdate;
use crate::model::{HASHING_MODEL_ID, Quantization};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a worker needs to load a model.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineParams {
    pub model_id: String,
    pub quantization: Quantization,
    pub cache_dir: Option<PathBuf>,
    pub batch_size: usize,
}

pub trait EmbeddingPipeline: Send {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order.
    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Builds a pipeline, reporting load progress through the callback.
pub type PipelineFactory = Arc<
    dyn Fn(&PipelineParams, &mut dyn FnMut(ProgressUpdate)) -> Result<Box<dyn EmbeddingPipeline>>
        + Send
        + Sync,
>;

/// The factory used by the worker binary: hashing for `hashing`, ONNX otherwise.
pub fn default_factory() -> PipelineFactory {
    Arc::new(load_pipeline)
}

/// Wrap a constructor that does not report progress, such as a custom
/// in-house pipeline.
pub fn factory_fn<F>(build: F) -> PipelineFactory
where
    F: Fn(&PipelineParams) -> Result<Box<dyn EmbeddingPipeline>> + Send + Sync + 'static,
{
    Arc::new(
        move |params: &PipelineParams, _progress: &mut dyn FnMut(ProgressUpdate)| build(params),
    )
}

pub fn load_pipeline(
    params: &PipelineParams,
    progress: &mut dyn FnMut(ProgressUpdate),
) -> Result<Box<dyn EmbeddingPipeline>> {
    if params.model_id == HASHING_MODEL_ID {
        progress(ProgressUpdate::new("ready", 100.0, "hashing model ready"));
        return Ok(Box::new(HashingPipeline::default()));
    }
    Ok(Box::new(OnnxPipeline::load(params, progress)?))
}

/// Scale a vector to unit length. Zero vectors are left alone.
pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}
