//! The one-shot export driver.
//!
//! Sequences the whole run: create the output directory, sanity-check the
//! cache-free forward pass against representative dummy inputs, serialize
//! the graph, persist the tokenizer artifacts, then verify that the file
//! actually landed on disk. Strictly linear, no retries.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error as E, Result};
use candle_core::{Device, Tensor};
use candle_onnx::onnx::ModelProto;
use prost::Message;
use tokenizers::Tokenizer;
use tracing::info;

use crate::hub::LoadedModel;
use crate::onnx;
use crate::stateless::StatelessLm;

pub const DEFAULT_GRAPH_FILENAME: &str = "model.onnx";

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub output_dir: PathBuf,
    pub graph_filename: String,
    /// Dummy-input sequence length. Only needs to be representative for
    /// the pre-export forward check, not semantically meaningful.
    pub seq_len: usize,
    pub batch_size: usize,
}

impl ExportRequest {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            graph_filename: DEFAULT_GRAPH_FILENAME.to_string(),
            seq_len: 10,
            batch_size: 1,
        }
    }

    pub fn graph_path(&self) -> PathBuf {
        self.output_dir.join(&self.graph_filename)
    }
}

#[derive(Debug)]
pub struct ExportReport {
    pub onnx_path: PathBuf,
    pub size_bytes: u64,
    pub vocab_size: usize,
}

impl ExportReport {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0 / 1024.0
    }
}

/// Terminal state of a run that did not itself error out.
#[derive(Debug)]
pub enum ExportOutcome {
    Complete(ExportReport),
    /// The writer returned normally but the expected file is not on disk.
    MissingArtifact { expected: PathBuf },
}

/// Deterministic dummy `(input_ids, position_ids)` for the forward check:
/// arbitrary valid token values, positions counting up from zero per row.
pub fn dummy_inputs(
    batch_size: usize,
    seq_len: usize,
    vocab_size: usize,
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
    let ids: Vec<u32> = (0..batch_size * seq_len)
        .map(|i| (i as u32).wrapping_mul(37).wrapping_add(11) % vocab_size as u32)
        .collect();
    let input_ids = Tensor::from_vec(ids, (batch_size, seq_len), device)?;

    let mut positions = Vec::with_capacity(batch_size * seq_len);
    for _ in 0..batch_size {
        positions.extend(0..seq_len as u32);
    }
    let position_ids = Tensor::from_vec(positions, (batch_size, seq_len), device)?;
    Ok((input_ids, position_ids))
}

/// Encode and write the graph, overwriting any stale file at `path`.
pub fn write_graph(path: &Path, model: &ModelProto) -> Result<()> {
    fs::write(path, model.encode_to_vec())
        .with_context(|| format!("writing graph to {}", path.display()))
}

/// Size of the artifact at `path`, or `None` if it does not exist.
pub fn artifact_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|meta| meta.len())
}

/// Write `tokenizer.json` and copy the remaining companion files into
/// `output_dir`.
pub fn save_tokenizer_artifacts(
    tokenizer: &Tokenizer,
    companion_files: &[PathBuf],
    output_dir: &Path,
) -> Result<()> {
    let tokenizer_path = output_dir.join("tokenizer.json");
    tokenizer.save(&tokenizer_path, false).map_err(E::msg)?;

    for file in companion_files {
        let Some(name) = file.file_name() else {
            continue;
        };
        if name == "tokenizer.json" {
            continue;
        }
        let dest = output_dir.join(name);
        if dest == *file {
            continue;
        }
        fs::copy(file, &dest)
            .with_context(|| format!("copying {} to {}", file.display(), dest.display()))?;
    }
    Ok(())
}

/// Run the export end to end. Consumes the loaded model; each run is
/// independent and idempotent at the artifact level.
pub fn run(loaded: LoadedModel, request: &ExportRequest) -> Result<ExportOutcome> {
    if request.seq_len == 0 || request.batch_size == 0 {
        bail!("dummy input must have batch >= 1 and length >= 1");
    }

    fs::create_dir_all(&request.output_dir)
        .with_context(|| format!("creating {}", request.output_dir.display()))?;

    let LoadedModel {
        model,
        config,
        tokenizer,
        weights,
        tokenizer_files,
    } = loaded;

    // Check the no-cache contract on the live model before serializing:
    // the exported graph promises [B, S, vocab] logits for all positions.
    let device = model.device().clone();
    let (input_ids, position_ids) =
        dummy_inputs(request.batch_size, request.seq_len, config.vocab_size, &device)?;
    let mut adapter = StatelessLm::new(model);
    let logits = adapter.forward(&input_ids, &position_ids)?;
    let dims = logits.dims3()?;
    if dims != (request.batch_size, request.seq_len, config.vocab_size) {
        bail!(
            "forward pass produced {dims:?}, expected ({}, {}, {})",
            request.batch_size,
            request.seq_len,
            config.vocab_size
        );
    }
    info!(?dims, "forward check passed");

    let proto = onnx::gpt2::build_model_proto(&config, &weights)?;
    let graph_path = request.graph_path();
    write_graph(&graph_path, &proto)?;
    info!(path = %graph_path.display(), "graph written");

    save_tokenizer_artifacts(&tokenizer, &tokenizer_files, &request.output_dir)?;

    // Post-hoc existence check; a missing file is reported, not retried.
    match artifact_size(&graph_path) {
        Some(size_bytes) => Ok(ExportOutcome::Complete(ExportReport {
            onnx_path: graph_path,
            size_bytes,
            vocab_size: config.vocab_size,
        })),
        None => Ok(ExportOutcome::MissingArtifact {
            expected: graph_path,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn dummy_ids_stay_in_vocab_and_positions_count_up() {
        let device = Device::Cpu;
        let (input_ids, position_ids) = dummy_inputs(2, 7, 50, &device).unwrap();
        assert_eq!(input_ids.dims(), &[2, 7]);
        for v in input_ids.flatten_all().unwrap().to_vec1::<u32>().unwrap() {
            assert!(v < 50);
        }
        let positions = position_ids.to_vec2::<u32>().unwrap();
        for row in positions {
            let expected: Vec<u32> = (0..7).collect();
            assert_eq!(row, expected);
        }
    }

    #[test]
    fn artifact_size_is_none_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(artifact_size(&dir.path().join("nope.onnx")), None);
    }

    #[test]
    fn write_graph_overwrites_stale_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"stale").unwrap();

        let model = ModelProto {
            ir_version: 7,
            producer_name: "test".to_string(),
            ..Default::default()
        };
        write_graph(&path, &model).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_ne!(bytes, b"stale");
        let decoded = ModelProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.producer_name, "test");
    }
}
