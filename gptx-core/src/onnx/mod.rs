//! ONNX serialization of the cache-free GPT-2 forward pass.

pub mod gpt2;
pub mod graph;
pub mod proto;

/// Names declared on the exported graph; consumers bind to these.
pub const INPUT_IDS: &str = "input_ids";
pub const POSITION_IDS: &str = "position_ids";
pub const LOGITS: &str = "logits";

/// Dynamic-axis labels for the batch and sequence dimensions.
pub const BATCH_DIM: &str = "batch_size";
pub const SEQ_DIM: &str = "sequence_length";
