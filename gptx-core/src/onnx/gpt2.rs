//! Lowering of the GPT-2 forward pass to an ONNX graph.
//!
//! This mirrors, op for op, the cache-free forward implemented in
//! `models::gpt2`: embedding gathers, pre-LN blocks with fused-QKV causal
//! attention, tanh-GELU MLPs, final layer norm and the tied LM head. Batch
//! and sequence length stay dynamic; the causal mask is built inside the
//! graph from the runtime sequence length, so the file is usable for any
//! input shape without re-export.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::ModelProto;

use super::graph::GraphBuilder;
use super::proto::{attr_int, attr_ints, Dim};
use super::{BATCH_DIM, INPUT_IDS, LOGITS, POSITION_IDS, SEQ_DIM};
use crate::models::gpt2::Config;

/// Dims and row-major f32 data of one checkpoint tensor.
fn tensor_data(weights: &HashMap<String, Tensor>, name: &str) -> Result<(Vec<i64>, Vec<f32>)> {
    let tensor = weights
        .get(name)
        .with_context(|| format!("checkpoint is missing tensor {name}"))?;
    let dims = tensor.dims().iter().map(|&d| d as i64).collect();
    let data = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok((dims, data))
}

/// Emit layer normalization over the last axis as primitive ops.
///
/// Staying with `ReduceMean`/`Sub`/`Sqrt`/`Div` keeps the graph inside the
/// opset-14 op surface, so runtimes without the fused `LayerNormalization`
/// op (including `candle_onnx::simple_eval`) can execute it.
fn layer_norm(
    g: &mut GraphBuilder,
    name: &str,
    x: &str,
    weight: &str,
    bias: &str,
    eps: &str,
) -> String {
    let last_axis = [attr_ints("axes", &[-1]), attr_int("keepdims", 1)];
    let mean = g.node("ReduceMean", &format!("{name}.mean"), &[x], &format!("{name}.mean_out"), last_axis.to_vec());
    let centered = g.node("Sub", &format!("{name}.center"), &[x, &mean], &format!("{name}.centered"), vec![]);
    let squared = g.node("Mul", &format!("{name}.square"), &[&centered, &centered], &format!("{name}.squared"), vec![]);
    let variance = g.node("ReduceMean", &format!("{name}.variance"), &[&squared], &format!("{name}.var"), last_axis.to_vec());
    let var_eps = g.node("Add", &format!("{name}.var_eps"), &[&variance, eps], &format!("{name}.var_stable"), vec![]);
    let std = g.node("Sqrt", &format!("{name}.std"), &[&var_eps], &format!("{name}.stddev"), vec![]);
    let normed = g.node("Div", &format!("{name}.normalize"), &[&centered, &std], &format!("{name}.normed"), vec![]);
    let scaled = g.node("Mul", &format!("{name}.scale"), &[&normed, weight], &format!("{name}.scaled"), vec![]);
    g.node("Add", &format!("{name}.shift"), &[&scaled, bias], &format!("{name}.out"), vec![])
}

/// Copy a checkpoint tensor into the graph as an initializer.
fn embed_weight(
    g: &mut GraphBuilder,
    weights: &HashMap<String, Tensor>,
    name: &str,
) -> Result<String> {
    let (dims, data) = tensor_data(weights, name)?;
    Ok(g.init_f32(name, &dims, &data))
}

/// Build the complete GPT-2 `ModelProto` from a loaded checkpoint.
///
/// Declared interface: `input_ids` and `position_ids` (int64, dynamic
/// `batch_size` x `sequence_length`) in, `logits` (f32, dynamic batch/seq,
/// static vocab) out.
pub fn build_model_proto(config: &Config, weights: &HashMap<String, Tensor>) -> Result<ModelProto> {
    if let Some(wte) = weights.get("wte.weight") {
        if wte.dims() != [config.vocab_size, config.n_embd] {
            bail!(
                "wte.weight has shape {:?}, expected [{}, {}]",
                wte.dims(),
                config.vocab_size,
                config.n_embd
            );
        }
    }

    let mut g = GraphBuilder::new();
    let dyn_2d = [Dim::Dynamic(BATCH_DIM), Dim::Dynamic(SEQ_DIM)];
    g.input(INPUT_IDS, DataType::Int64, &dyn_2d);
    g.input(POSITION_IDS, DataType::Int64, &dyn_2d);
    g.output(
        LOGITS,
        DataType::Float,
        &[
            Dim::Dynamic(BATCH_DIM),
            Dim::Dynamic(SEQ_DIM),
            Dim::Fixed(config.vocab_size as i64),
        ],
    );

    // ── Shared constants ────────────────────────────────────────────
    let heads = config.n_head as i64;
    let head_dim = config.head_dim() as i64;
    let n_embd = config.n_embd as i64;

    let qkv_split = g.init_i64("const.qkv_split", &[3], &[n_embd, n_embd, n_embd]);
    // Reshape with 0 copies the corresponding input dim, keeping B and S dynamic.
    let split_heads = g.init_i64("const.split_heads", &[4], &[0, 0, heads, head_dim]);
    let merge_heads = g.init_i64("const.merge_heads", &[3], &[0, 0, n_embd]);
    let axes_0 = g.init_i64("const.axes_0", &[1], &[0]);
    let axes_1 = g.init_i64("const.axes_1", &[1], &[1]);
    let seq_axis = g.scalar_i64("const.seq_axis", 1);
    let zero_i64 = g.scalar_i64("const.zero_i64", 0);
    let one_i64 = g.scalar_i64("const.one_i64", 1);
    let zero_f32 = g.scalar_f32("const.zero_f32", 0.0);
    let mask_value = g.scalar_f32("const.mask_value", -1e9);
    let attn_scale = g.scalar_f32("const.attn_scale", 1.0 / (head_dim as f32).sqrt());
    // Tanh approximation of GELU, as in the checkpoint's gelu_new.
    let gelu_pow = g.scalar_f32("const.gelu_pow", 3.0);
    let gelu_c0 = g.scalar_f32("const.gelu_c0", 0.044_715);
    let gelu_c1 = g.scalar_f32("const.gelu_c1", 0.797_884_6);
    let one_f32 = g.scalar_f32("const.one_f32", 1.0);
    let half_f32 = g.scalar_f32("const.half_f32", 0.5);
    let ln_eps = g.scalar_f32("const.ln_eps", config.layer_norm_epsilon as f32);

    // ── Embeddings ──────────────────────────────────────────────────
    let wte = embed_weight(&mut g, weights, "wte.weight")?;
    let wpe = embed_weight(&mut g, weights, "wpe.weight")?;
    let tok_emb = g.node("Gather", "embed.tokens", &[&wte, INPUT_IDS], "tok_emb", vec![attr_int("axis", 0)]);
    let pos_emb = g.node("Gather", "embed.positions", &[&wpe, POSITION_IDS], "pos_emb", vec![attr_int("axis", 0)]);
    let mut hidden = g.node("Add", "embed.sum", &[&tok_emb, &pos_emb], "embeddings", vec![]);

    // ── Causal mask from the runtime sequence length ────────────────
    // mask[i, j] = -1e9 where j > i, else 0; broadcast over batch and heads.
    let ids_shape = g.node("Shape", "mask.shape", &[INPUT_IDS], "mask.ids_shape", vec![]);
    let seq_len = g.node("Gather", "mask.seq_len", &[&ids_shape, &seq_axis], "mask.seq_len_scalar", vec![attr_int("axis", 0)]);
    let positions = g.node("Range", "mask.range", &[&zero_i64, &seq_len, &one_i64], "mask.positions", vec![]);
    let rows = g.node("Unsqueeze", "mask.rows", &[&positions, &axes_1], "mask.rows_2d", vec![]);
    let cols = g.node("Unsqueeze", "mask.cols", &[&positions, &axes_0], "mask.cols_2d", vec![]);
    let future = g.node("Greater", "mask.future", &[&cols, &rows], "mask.is_future", vec![]);
    let causal_mask = g.node("Where", "mask.select", &[&future, &mask_value, &zero_f32], "causal_mask", vec![]);

    // ── Transformer blocks ──────────────────────────────────────────
    for i in 0..config.n_layer {
        let p = format!("h{i}");
        let w = |suffix: &str| format!("h.{i}.{suffix}");

        let ln1_w = embed_weight(&mut g, weights, &w("ln_1.weight"))?;
        let ln1_b = embed_weight(&mut g, weights, &w("ln_1.bias"))?;
        let ln1 = layer_norm(&mut g, &format!("{p}.ln_1"), &hidden, &ln1_w, &ln1_b, &ln_eps);

        // Fused QKV projection, then split into per-head layouts.
        let c_attn_w = embed_weight(&mut g, weights, &w("attn.c_attn.weight"))?;
        let c_attn_b = embed_weight(&mut g, weights, &w("attn.c_attn.bias"))?;
        let qkv_mm = g.node("MatMul", &format!("{p}.attn.qkv_matmul"), &[&ln1, &c_attn_w], &format!("{p}.attn.qkv_mm"), vec![]);
        let qkv = g.node("Add", &format!("{p}.attn.qkv_bias"), &[&qkv_mm, &c_attn_b], &format!("{p}.attn.qkv"), vec![]);
        let (q, k, v) = (
            format!("{p}.attn.q"),
            format!("{p}.attn.k"),
            format!("{p}.attn.v"),
        );
        g.node_multi(
            "Split",
            &format!("{p}.attn.split"),
            &[&qkv, &qkv_split],
            &[&q, &k, &v],
            vec![attr_int("axis", -1)],
        );

        let q4 = g.node("Reshape", &format!("{p}.attn.q_reshape"), &[&q, &split_heads], &format!("{p}.attn.q4"), vec![]);
        let qt = g.node("Transpose", &format!("{p}.attn.q_transpose"), &[&q4], &format!("{p}.attn.qt"), vec![attr_ints("perm", &[0, 2, 1, 3])]);
        let k4 = g.node("Reshape", &format!("{p}.attn.k_reshape"), &[&k, &split_heads], &format!("{p}.attn.k4"), vec![]);
        // K goes straight to [B, H, head_dim, S] so the score MatMul needs no extra transpose.
        let kt = g.node("Transpose", &format!("{p}.attn.k_transpose"), &[&k4], &format!("{p}.attn.kt"), vec![attr_ints("perm", &[0, 2, 3, 1])]);
        let v4 = g.node("Reshape", &format!("{p}.attn.v_reshape"), &[&v, &split_heads], &format!("{p}.attn.v4"), vec![]);
        let vt = g.node("Transpose", &format!("{p}.attn.v_transpose"), &[&v4], &format!("{p}.attn.vt"), vec![attr_ints("perm", &[0, 2, 1, 3])]);

        let scores = g.node("MatMul", &format!("{p}.attn.scores"), &[&qt, &kt], &format!("{p}.attn.scores_raw"), vec![]);
        let scaled = g.node("Mul", &format!("{p}.attn.scale"), &[&scores, &attn_scale], &format!("{p}.attn.scores_scaled"), vec![]);
        let masked = g.node("Add", &format!("{p}.attn.mask"), &[&scaled, &causal_mask], &format!("{p}.attn.scores_masked"), vec![]);
        let probs = g.node("Softmax", &format!("{p}.attn.softmax"), &[&masked], &format!("{p}.attn.probs"), vec![attr_int("axis", -1)]);
        let ctx = g.node("MatMul", &format!("{p}.attn.context"), &[&probs, &vt], &format!("{p}.attn.ctx"), vec![]);
        let ctx_t = g.node("Transpose", &format!("{p}.attn.ctx_transpose"), &[&ctx], &format!("{p}.attn.ctx_t"), vec![attr_ints("perm", &[0, 2, 1, 3])]);
        let merged = g.node("Reshape", &format!("{p}.attn.merge"), &[&ctx_t, &merge_heads], &format!("{p}.attn.merged"), vec![]);

        let c_proj_w = embed_weight(&mut g, weights, &w("attn.c_proj.weight"))?;
        let c_proj_b = embed_weight(&mut g, weights, &w("attn.c_proj.bias"))?;
        let proj_mm = g.node("MatMul", &format!("{p}.attn.proj_matmul"), &[&merged, &c_proj_w], &format!("{p}.attn.proj_mm"), vec![]);
        let attn_out = g.node("Add", &format!("{p}.attn.proj_bias"), &[&proj_mm, &c_proj_b], &format!("{p}.attn.out"), vec![]);
        let resid1 = g.node("Add", &format!("{p}.residual_1"), &[&hidden, &attn_out], &format!("{p}.resid1"), vec![]);

        let ln2_w = embed_weight(&mut g, weights, &w("ln_2.weight"))?;
        let ln2_b = embed_weight(&mut g, weights, &w("ln_2.bias"))?;
        let ln2 = layer_norm(&mut g, &format!("{p}.ln_2"), &resid1, &ln2_w, &ln2_b, &ln_eps);

        let c_fc_w = embed_weight(&mut g, weights, &w("mlp.c_fc.weight"))?;
        let c_fc_b = embed_weight(&mut g, weights, &w("mlp.c_fc.bias"))?;
        let fc_mm = g.node("MatMul", &format!("{p}.mlp.fc_matmul"), &[&ln2, &c_fc_w], &format!("{p}.mlp.fc_mm"), vec![]);
        let fc = g.node("Add", &format!("{p}.mlp.fc_bias"), &[&fc_mm, &c_fc_b], &format!("{p}.mlp.fc"), vec![]);

        // gelu_new(x) = 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
        let cubed = g.node("Pow", &format!("{p}.mlp.gelu_pow"), &[&fc, &gelu_pow], &format!("{p}.mlp.x3"), vec![]);
        let inner_scaled = g.node("Mul", &format!("{p}.mlp.gelu_c0"), &[&cubed, &gelu_c0], &format!("{p}.mlp.x3s"), vec![]);
        let inner_sum = g.node("Add", &format!("{p}.mlp.gelu_inner"), &[&fc, &inner_scaled], &format!("{p}.mlp.inner"), vec![]);
        let inner = g.node("Mul", &format!("{p}.mlp.gelu_c1"), &[&inner_sum, &gelu_c1], &format!("{p}.mlp.inner_s"), vec![]);
        let tanh = g.node("Tanh", &format!("{p}.mlp.gelu_tanh"), &[&inner], &format!("{p}.mlp.tanh"), vec![]);
        let gate = g.node("Add", &format!("{p}.mlp.gelu_one"), &[&tanh, &one_f32], &format!("{p}.mlp.gate"), vec![]);
        let gated = g.node("Mul", &format!("{p}.mlp.gelu_mul"), &[&fc, &gate], &format!("{p}.mlp.gated"), vec![]);
        let act = g.node("Mul", &format!("{p}.mlp.gelu_half"), &[&gated, &half_f32], &format!("{p}.mlp.act"), vec![]);

        let mlp_proj_w = embed_weight(&mut g, weights, &w("mlp.c_proj.weight"))?;
        let mlp_proj_b = embed_weight(&mut g, weights, &w("mlp.c_proj.bias"))?;
        let mlp_mm = g.node("MatMul", &format!("{p}.mlp.proj_matmul"), &[&act, &mlp_proj_w], &format!("{p}.mlp.proj_mm"), vec![]);
        let mlp_out = g.node("Add", &format!("{p}.mlp.proj_bias"), &[&mlp_mm, &mlp_proj_b], &format!("{p}.mlp.out"), vec![]);
        hidden = g.node("Add", &format!("{p}.residual_2"), &[&resid1, &mlp_out], &format!("{p}.out"), vec![]);
    }

    // ── Final norm and tied LM head ─────────────────────────────────
    let lnf_w = embed_weight(&mut g, weights, "ln_f.weight")?;
    let lnf_b = embed_weight(&mut g, weights, "ln_f.bias")?;
    let final_hidden = layer_norm(&mut g, "ln_f", &hidden, &lnf_w, &lnf_b, &ln_eps);
    // The LM head reuses wte; transposing in-graph avoids storing the
    // 50257 x 768 matrix twice.
    let head = g.node("Transpose", "lm_head.tie", &[&wte], "lm_head.weight_t", vec![attr_ints("perm", &[1, 0])]);
    g.node("MatMul", "lm_head", &[&final_hidden, &head], LOGITS, vec![]);

    Ok(g.finish(
        "gpt2_no_cache",
        "GPT-2 full-sequence forward pass, KV cache disabled",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use candle_onnx::onnx::tensor_shape_proto::dimension;
    use candle_onnx::onnx::type_proto;
    use candle_onnx::onnx::ValueInfoProto;
    use std::collections::HashSet;

    fn dim_names(vi: &ValueInfoProto) -> Vec<String> {
        let ty = vi.r#type.as_ref().unwrap();
        let tensor = match ty.value.as_ref().unwrap() {
            type_proto::Value::TensorType(t) => t,
            other => panic!("unexpected type value: {other:?}"),
        };
        tensor
            .shape
            .as_ref()
            .unwrap()
            .dim
            .iter()
            .map(|d| match d.value.as_ref().unwrap() {
                dimension::Value::DimParam(p) => p.clone(),
                dimension::Value::DimValue(v) => v.to_string(),
            })
            .collect()
    }

    fn build_tiny() -> ModelProto {
        let device = candle_core::Device::Cpu;
        let config = testing::tiny_config();
        let weights = testing::tiny_checkpoint(&config, &device).unwrap();
        build_model_proto(&config, &weights).unwrap()
    }

    #[test]
    fn declares_the_export_interface() {
        let model = build_tiny();
        let graph = model.graph.unwrap();

        let input_names: Vec<_> = graph.input.iter().map(|i| i.name.clone()).collect();
        assert_eq!(input_names, vec![INPUT_IDS, POSITION_IDS]);
        assert_eq!(graph.output.len(), 1);
        assert_eq!(graph.output[0].name, LOGITS);

        for input in &graph.input {
            assert_eq!(dim_names(input), vec![BATCH_DIM, SEQ_DIM]);
        }
        let vocab = testing::tiny_config().vocab_size.to_string();
        assert_eq!(dim_names(&graph.output[0]), vec![BATCH_DIM.to_string(), SEQ_DIM.to_string(), vocab]);
    }

    #[test]
    fn graph_is_topologically_closed() {
        let model = build_tiny();
        let graph = model.graph.unwrap();

        let mut known: HashSet<String> = graph.input.iter().map(|i| i.name.clone()).collect();
        known.extend(graph.initializer.iter().map(|i| i.name.clone()));
        for node in &graph.node {
            assert!(!node.op_type.is_empty());
            for input in &node.input {
                assert!(known.contains(input), "node {} reads undefined {input}", node.name);
            }
            known.extend(node.output.iter().cloned());
        }
        assert!(known.contains(LOGITS));
    }

    /// Every weight the forward pass reads, by canonical checkpoint name.
    fn required_weight_names(config: &Config) -> Vec<String> {
        let mut names = vec![
            "wte.weight".to_string(),
            "wpe.weight".to_string(),
            "ln_f.weight".to_string(),
            "ln_f.bias".to_string(),
        ];
        for i in 0..config.n_layer {
            for suffix in [
                "ln_1.weight",
                "ln_1.bias",
                "attn.c_attn.weight",
                "attn.c_attn.bias",
                "attn.c_proj.weight",
                "attn.c_proj.bias",
                "ln_2.weight",
                "ln_2.bias",
                "mlp.c_fc.weight",
                "mlp.c_fc.bias",
                "mlp.c_proj.weight",
                "mlp.c_proj.bias",
            ] {
                names.push(format!("h.{i}.{suffix}"));
            }
        }
        names
    }

    #[test]
    fn embeds_required_weights_and_skips_extra_buffers() {
        let device = candle_core::Device::Cpu;
        let config = testing::tiny_config();
        let mut weights = testing::tiny_checkpoint(&config, &device).unwrap();
        // Real GPT-2 checkpoints also carry per-layer mask buffers that are
        // not model weights; the emitter must leave them out of the file.
        let positions = config.n_positions;
        weights.insert(
            "h.0.attn.bias".to_string(),
            Tensor::ones((1, 1, positions, positions), DType::F32, &device).unwrap(),
        );
        let model = build_model_proto(&config, &weights).unwrap();
        let graph = model.graph.unwrap();

        let initializer_names: HashSet<_> =
            graph.initializer.iter().map(|i| i.name.clone()).collect();
        for name in required_weight_names(&config) {
            assert!(initializer_names.contains(&name), "missing initializer {name}");
        }
        assert!(!initializer_names.contains("h.0.attn.bias"));

        // Raw data must actually be embedded, not referenced externally.
        let wte = graph.initializer.iter().find(|i| i.name == "wte.weight").unwrap();
        assert_eq!(wte.raw_data.len(), config.vocab_size * config.n_embd * 4);
    }

    #[test]
    fn graph_eval_matches_model_logits() {
        let device = candle_core::Device::Cpu;
        let config = testing::tiny_config();
        let weights = testing::tiny_checkpoint(&config, &device).unwrap();
        let model_proto = build_model_proto(&config, &weights).unwrap();

        let vb = candle_nn::VarBuilder::from_tensors(weights, DType::F32, &device);
        let mut model = crate::models::gpt2::Gpt2Model::new(&config, vb).unwrap();

        let tokens: Vec<i64> = vec![3, 1, 4, 1, 5, 9, 2, 6, 5, 3];
        let seq_len = tokens.len();
        let positions: Vec<i64> = (0..seq_len as i64).collect();

        let ids = Tensor::from_vec(
            tokens.iter().map(|&t| t as u32).collect::<Vec<u32>>(),
            (1, seq_len),
            &device,
        )
        .unwrap();
        let pos = Tensor::from_vec(
            positions.iter().map(|&p| p as u32).collect::<Vec<u32>>(),
            (1, seq_len),
            &device,
        )
        .unwrap();
        let expected = model.forward(&ids, &pos, false).unwrap();

        let mut inputs = HashMap::new();
        inputs.insert(
            INPUT_IDS.to_string(),
            Tensor::from_vec(tokens, (1, seq_len), &device).unwrap(),
        );
        inputs.insert(
            POSITION_IDS.to_string(),
            Tensor::from_vec(positions, (1, seq_len), &device).unwrap(),
        );
        let mut outputs = candle_onnx::simple_eval(&model_proto, inputs).unwrap();
        let logits = outputs.remove(LOGITS).unwrap();
        assert_eq!(logits.dims3().unwrap(), (1, seq_len, config.vocab_size));

        let deviation = logits
            .sub(&expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .fold(0f32, f32::max);
        assert!(deviation < 1e-4, "graph and model disagree by {deviation}");
    }

    #[test]
    fn missing_weight_is_reported_by_name() {
        let device = candle_core::Device::Cpu;
        let config = testing::tiny_config();
        let mut weights = testing::tiny_checkpoint(&config, &device).unwrap();
        weights.remove("h.1.mlp.c_fc.bias");
        let err = build_model_proto(&config, &weights).unwrap_err();
        assert!(format!("{err:#}").contains("h.1.mlp.c_fc.bias"));
    }

    #[test]
    fn rejects_vocab_mismatch() {
        let device = candle_core::Device::Cpu;
        let config = testing::tiny_config();
        let weights = testing::tiny_checkpoint(&config, &device).unwrap();
        let mut bad = config.clone();
        bad.vocab_size += 1;
        assert!(build_model_proto(&bad, &weights).is_err());
    }
}
