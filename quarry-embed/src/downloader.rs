//! HuggingFace model downloading functionality

use crate::error::{EmbedError, Result};
use crate::events::ProgressUpdate;
use crate::model::Quantization;
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use std::path::{Path, PathBuf};

/// Tokenizer files every Transformers.js style repository ships next to its ONNX weights.
pub const TOKENIZER_FILES: [&str; 4] = [
    "tokenizer.json",
    "config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

/// Local paths of a downloaded model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub onnx: PathBuf,
    pub tokenizer: PathBuf,
    pub config: PathBuf,
    pub special_tokens_map: PathBuf,
    pub tokenizer_config: PathBuf,
}

/// Downloads models from HuggingFace Hub into a local cache.
///
/// Runs synchronously: it is only ever called from a worker, which is already
/// off the async runtime. Files already in the cache are not fetched again.
pub struct ModelDownloader {
    api: Api,
}

impl ModelDownloader {
    /// Create a downloader writing into `cache_dir`, or the default HuggingFace cache.
    ///
    /// Authentication uses whatever token the hub client finds in its cache.
    pub fn new(cache_dir: Option<&Path>) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder
            .build()
            .map_err(|e| EmbedError::init(format!("cannot create HuggingFace client: {e}")))?;
        Ok(Self { api })
    }

    /// Make sure the weights for `quantization` and the tokenizer files of
    /// `repo_id` are present, downloading them if needed.
    ///
    /// The first ONNX candidate the repository provides wins, so a repository
    /// without a quantized export still loads its full-precision weights.
    pub fn ensure_model(
        &self,
        repo_id: &str,
        quantization: Quantization,
        progress: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<ModelFiles> {
        let repo = self.api.model(repo_id.to_string());
        progress(ProgressUpdate::new(
            "downloading",
            0.0,
            format!("fetching {repo_id} ({quantization})"),
        ));

        let onnx = self.fetch_onnx(&repo, repo_id, quantization)?;
        progress(ProgressUpdate::new("downloading", 60.0, "model weights ready"));

        let mut tokenizer_paths = Vec::with_capacity(TOKENIZER_FILES.len());
        for file in TOKENIZER_FILES {
            let path = repo.get(file).map_err(|e| {
                EmbedError::init(format!("cannot download {file} from {repo_id}: {e}"))
            })?;
            tokenizer_paths.push(path);
        }
        progress(ProgressUpdate::new("downloading", 100.0, "tokenizer ready"));
        tracing::info!("Model {} available at {}", repo_id, onnx.display());

        let [tokenizer, config, special_tokens_map, tokenizer_config]: [PathBuf; 4] =
            tokenizer_paths
                .try_into()
                .map_err(|_| EmbedError::init("incomplete tokenizer download"))?;

        Ok(ModelFiles {
            onnx,
            tokenizer,
            config,
            special_tokens_map,
            tokenizer_config,
        })
    }

    fn fetch_onnx(&self, repo: &ApiRepo, repo_id: &str, quantization: Quantization) -> Result<PathBuf> {
        let mut last_error = None;
        for candidate in quantization.onnx_candidates() {
            match repo.get(candidate) {
                Ok(path) => return Ok(path),
                Err(e) => {
                    tracing::debug!("{repo_id} has no {candidate}: {e}");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(EmbedError::init(format!(
            "no ONNX weights for {quantization} in {repo_id}: {}",
            last_error.unwrap_or_else(|| "no candidates".to_string())
        )))
    }
}
