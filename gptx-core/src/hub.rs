//! Pretrained artifact loading.
//!
//! Fetches `config.json`, the safetensors checkpoint and the tokenizer
//! files either from the HuggingFace Hub or from a local checkpoint
//! directory, and builds the candle model from them. The raw tensor map is
//! kept alongside the model: the ONNX emitter serializes weights from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::models::gpt2::{Config, Gpt2Model};

/// Tokenizer artifacts copied next to the exported graph when present.
const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "vocab.json",
    "merges.txt",
    "special_tokens_map.json",
];

pub struct LoadedModel {
    pub model: Gpt2Model,
    pub config: Config,
    pub tokenizer: Tokenizer,
    /// Checkpoint tensors under canonical (unprefixed) names; the ONNX
    /// emitter reads weight data from here.
    pub weights: HashMap<String, Tensor>,
    /// Tokenizer files to copy into the output directory.
    pub tokenizer_files: Vec<PathBuf>,
}

/// Load model and tokenizer from the HuggingFace Hub.
pub fn from_pretrained(
    model_id: &str,
    revision: Option<&str>,
    device: &Device,
    dtype: DType,
) -> Result<LoadedModel> {
    info!(model_id, "fetching checkpoint from the hub");
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.unwrap_or("main").to_string(),
    ));

    let config_path = repo.get("config.json")?;
    let weights_path = repo.get("model.safetensors")?;
    let mut tokenizer_files = Vec::new();
    for name in TOKENIZER_FILES {
        // Not every repo carries every companion file.
        if let Ok(path) = repo.get(name) {
            tokenizer_files.push(path);
        }
    }

    load_from_paths(&config_path, &weights_path, tokenizer_files, device, dtype)
}

/// Load model and tokenizer from an already-downloaded checkpoint directory.
pub fn from_local(dir: impl AsRef<Path>, device: &Device, dtype: DType) -> Result<LoadedModel> {
    let dir = dir.as_ref();
    info!(path = %dir.display(), "loading checkpoint from disk");

    let config_path = dir.join("config.json");
    let weights_path = dir.join("model.safetensors");
    if !weights_path.is_file() {
        bail!("no model.safetensors under {}", dir.display());
    }
    let tokenizer_files: Vec<PathBuf> = TOKENIZER_FILES
        .iter()
        .map(|name| dir.join(name))
        .filter(|path| path.is_file())
        .collect();

    load_from_paths(&config_path, &weights_path, tokenizer_files, device, dtype)
}

fn load_from_paths(
    config_path: &Path,
    weights_path: &Path,
    tokenizer_files: Vec<PathBuf>,
    device: &Device,
    dtype: DType,
) -> Result<LoadedModel> {
    let config: Config = serde_json::from_str(
        &std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?,
    )
    .context("parsing config.json")?;

    let tokenizer_path = tokenizer_files
        .iter()
        .find(|path| path.file_name().is_some_and(|f| f == "tokenizer.json"))
        .context("checkpoint has no tokenizer.json")?;
    let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(E::msg)?;

    let weights = candle_core::safetensors::load(weights_path, device)
        .with_context(|| format!("loading {}", weights_path.display()))?;
    let weights = canonical_weight_names(weights);
    info!(tensors = weights.len(), "checkpoint loaded");

    let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
    let model = Gpt2Model::new(&config, vb)?;

    Ok(LoadedModel {
        model,
        config,
        tokenizer,
        weights,
        tokenizer_files,
    })
}

/// Strip the `transformer.` prefix some GPT-2 checkpoints carry, so the
/// rest of the crate only ever sees one naming scheme.
fn canonical_weight_names(weights: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    weights
        .into_iter()
        .map(|(name, tensor)| {
            let name = name
                .strip_prefix("transformer.")
                .map(str::to_string)
                .unwrap_or(name);
            (name, tensor)
        })
        .collect()
}
