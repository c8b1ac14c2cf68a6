//! Transformer embeddings through fastembed's ONNX runtime.

use super::{EmbeddingPipeline, PipelineParams, l2_normalize};
use crate::downloader::{ModelDownloader, ModelFiles};
use crate::error::{EmbedError, Result};
use crate::events::ProgressUpdate;
use crate::model::ModelSpec;
use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use std::fs;
use std::path::Path;

/// A HuggingFace ONNX export run with mean pooling and L2 normalization.
pub struct OnnxPipeline {
    spec: ModelSpec,
    model: TextEmbedding,
    batch_size: usize,
    dimensions: usize,
}

impl std::fmt::Debug for OnnxPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxPipeline")
            .field("model_id", &self.spec.model_id)
            .field("batch_size", &self.batch_size)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl OnnxPipeline {
    pub fn load(params: &PipelineParams, progress: &mut dyn FnMut(ProgressUpdate)) -> Result<Self> {
        progress(ProgressUpdate::new(
            "loading",
            0.0,
            format!("loading {}", params.model_id),
        ));

        let downloader = ModelDownloader::new(params.cache_dir.as_deref())?;
        let files = downloader.ensure_model(&params.model_id, params.quantization, progress)?;

        progress(ProgressUpdate::new("loading", 60.0, "initializing ONNX session"));
        let model = build_model(&files)?;
        let spec = ModelSpec::for_model(&params.model_id);

        let mut pipeline = Self {
            dimensions: spec.dimensions,
            spec,
            model,
            batch_size: params.batch_size.max(1),
        };

        // The table in `ModelSpec` is a guess; ask the model itself.
        let probe = pipeline.embed(&["dimension probe".to_string()])?;
        if let Some(vector) = probe.first() {
            pipeline.dimensions = vector.len();
        }

        progress(ProgressUpdate::new(
            "ready",
            100.0,
            format!("{} ready ({} dimensions)", params.model_id, pipeline.dimensions),
        ));
        Ok(pipeline)
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| EmbedError::init(format!("cannot read {}: {e}", path.display())))
}

fn build_model(files: &ModelFiles) -> Result<TextEmbedding> {
    let tokenizer_files = TokenizerFiles {
        tokenizer_file: read(&files.tokenizer)?,
        config_file: read(&files.config)?,
        special_tokens_map_file: read(&files.special_tokens_map)?,
        tokenizer_config_file: read(&files.tokenizer_config)?,
    };
    let user_model =
        UserDefinedEmbeddingModel::new(read(&files.onnx)?, tokenizer_files).with_pooling(Pooling::Mean);

    TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
        .map_err(|e| EmbedError::init(format!("cannot create ONNX session: {e}")))
}

impl EmbeddingPipeline for OnnxPipeline {
    fn model_id(&self) -> &str {
        &self.spec.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = self
            .model
            .embed(texts.to_vec(), Some(self.batch_size.min(texts.len())))
            .map_err(|e| EmbedError::generation(e.to_string()))?;
        vectors.iter_mut().for_each(|v| l2_normalize(v));
        Ok(vectors)
    }
}
