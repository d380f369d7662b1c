//! Shared fixtures for unit and integration tests.
//!
//! A scaled-down GPT-2 configuration and a matching synthetic checkpoint,
//! so tests exercise the real load/forward/export paths without the 124M
//! parameter download.

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

use crate::models::gpt2::{Config, Gpt2Model};

/// Two-layer, two-head GPT-2 with an 8-dim embedding.
pub fn tiny_config() -> Config {
    Config {
        vocab_size: 32,
        n_positions: 16,
        n_embd: 8,
        n_layer: 2,
        n_head: 2,
        layer_norm_epsilon: 1e-5,
        activation_function: "gelu_new".to_string(),
    }
}

/// Random checkpoint tensors for `config`, keyed by the canonical
/// (unprefixed) GPT-2 weight names.
pub fn tiny_checkpoint(config: &Config, device: &Device) -> Result<HashMap<String, Tensor>> {
    let e = config.n_embd;
    let mut tensors = HashMap::new();

    let mut randn = |name: &str, dims: &[usize]| -> Result<()> {
        let t = Tensor::randn(0f32, 0.02f32, dims, device)?;
        tensors.insert(name.to_string(), t);
        Ok(())
    };

    randn("wte.weight", &[config.vocab_size, e])?;
    randn("wpe.weight", &[config.n_positions, e])?;
    for i in 0..config.n_layer {
        randn(&format!("h.{i}.attn.c_attn.weight"), &[e, 3 * e])?;
        randn(&format!("h.{i}.attn.c_attn.bias"), &[3 * e])?;
        randn(&format!("h.{i}.attn.c_proj.weight"), &[e, e])?;
        randn(&format!("h.{i}.attn.c_proj.bias"), &[e])?;
        randn(&format!("h.{i}.mlp.c_fc.weight"), &[e, config.intermediate_size()])?;
        randn(&format!("h.{i}.mlp.c_fc.bias"), &[config.intermediate_size()])?;
        randn(&format!("h.{i}.mlp.c_proj.weight"), &[config.intermediate_size(), e])?;
        randn(&format!("h.{i}.mlp.c_proj.bias"), &[e])?;
    }

    // Layer norms start at identity.
    let mut norm = |name: &str| -> Result<()> {
        tensors.insert(format!("{name}.weight"), Tensor::ones(e, DType::F32, device)?);
        tensors.insert(format!("{name}.bias"), Tensor::zeros(e, DType::F32, device)?);
        Ok(())
    };
    for i in 0..config.n_layer {
        norm(&format!("h.{i}.ln_1"))?;
        norm(&format!("h.{i}.ln_2"))?;
    }
    norm("ln_f")?;

    Ok(tensors)
}

/// Build a model directly from a fresh synthetic checkpoint.
pub fn tiny_model(config: &Config, device: &Device) -> Result<Gpt2Model> {
    let tensors = tiny_checkpoint(config, device)?;
    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    Gpt2Model::new(config, vb)
}
