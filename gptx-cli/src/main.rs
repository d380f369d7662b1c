use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gptx_core::export::{self, ExportOutcome, ExportRequest};
use gptx_core::models::{DType, Device};
use gptx_core::{hub, onnx};

// ── CLI ──

#[derive(Parser, Debug)]
#[command(
    name = "gptx",
    about = "Export GPT-2 to ONNX with the KV cache disabled (full-sequence inference)"
)]
struct Args {
    /// HuggingFace model id to fetch
    #[arg(long, default_value = "gpt2")]
    model_id: String,

    /// Checkpoint revision on the hub
    #[arg(long, default_value = "main")]
    revision: String,

    /// Load from a local checkpoint directory instead of the hub
    #[arg(long)]
    model_path: Option<String>,

    /// Directory receiving model.onnx and the tokenizer files
    #[arg(long, default_value = "models")]
    output_dir: String,

    /// Graph filename inside the output directory
    #[arg(long, default_value = export::DEFAULT_GRAPH_FILENAME)]
    graph_filename: String,

    /// Dummy-input sequence length for the pre-export forward check
    #[arg(long, default_value_t = 10)]
    seq_len: usize,

    /// Use CPU even if a GPU is available
    #[arg(long)]
    cpu: bool,

    /// Exit non-zero when the export finishes without a file on disk
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    info!(?device, "loading model");

    let loaded = match &args.model_path {
        Some(path) => hub::from_local(path, &device, DType::F32)?,
        None => hub::from_pretrained(&args.model_id, Some(&args.revision), &device, DType::F32)?,
    };

    let mut request = ExportRequest::new(&args.output_dir);
    request.graph_filename = args.graph_filename.clone();
    request.seq_len = args.seq_len;

    info!("exporting to ONNX");
    match export::run(loaded, &request)? {
        ExportOutcome::Complete(report) => {
            println!("[SUCCESS] Model exported successfully!");
            println!(
                "  ONNX model: {} ({:.2} MB)",
                report.onnx_path.display(),
                report.size_mb()
            );
            println!("  Tokenizer: {}/", args.output_dir);
            println!();
            println!("Model signature:");
            println!(
                "  Inputs: {} [batch, seq_len], {} [batch, seq_len]",
                onnx::INPUT_IDS,
                onnx::POSITION_IDS
            );
            println!(
                "  Output: {} [batch, seq_len, vocab_size={}]",
                onnx::LOGITS,
                report.vocab_size
            );
            println!("  No KV cache (use_cache=false)");
            Ok(())
        }
        ExportOutcome::MissingArtifact { expected } => {
            eprintln!(
                "[ERROR] Export failed - file not found: {}",
                expected.display()
            );
            if args.strict {
                bail!("exported graph missing at {}", expected.display());
            }
            Ok(())
        }
    }
}
