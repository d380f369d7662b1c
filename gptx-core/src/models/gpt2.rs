use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

fn default_vocab_size() -> usize {
    50257
}

fn default_n_positions() -> usize {
    1024
}

fn default_n_embd() -> usize {
    768
}

fn default_n_layer() -> usize {
    12
}

fn default_n_head() -> usize {
    12
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_activation_function() -> String {
    "gelu_new".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_activation_function")]
    pub activation_function: String,
}

impl Config {
    /// Configuration of the GPT-2 (small, 124M) checkpoint.
    pub fn gpt2() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            n_positions: default_n_positions(),
            n_embd: default_n_embd(),
            n_layer: default_n_layer(),
            n_head: default_n_head(),
            layer_norm_epsilon: default_layer_norm_epsilon(),
            activation_function: default_activation_function(),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn intermediate_size(&self) -> usize {
        4 * self.n_embd
    }
}

/// Load a GPT-2 `Conv1D` weight as a `Linear` layer.
///
/// The checkpoint stores these weights as `[in, out]` while `Linear`
/// expects `[out, in]`, so the tensor is transposed here once at load time.
fn conv1d_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let c_attn = conv1d_linear(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d_linear(config.n_embd, config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_dim: config.head_dim(),
            kv_cache: None,
        })
    }

    fn cache_len(&self) -> usize {
        self.kv_cache
            .as_ref()
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    fn forward(&mut self, hidden_states: &Tensor, mask: Option<&Tensor>, use_cache: bool) -> Result<Tensor> {
        let (b_sz, seq_len, _) = hidden_states.dims3()?;
        let hidden = self.n_head * self.head_dim;

        // Fused QKV projection: [B, S, E] -> [B, S, 3E]
        let qkv = self.c_attn.forward(hidden_states)?;
        let q = qkv.narrow(D::Minus1, 0, hidden)?;
        let k = qkv.narrow(D::Minus1, hidden, hidden)?;
        let v = qkv.narrow(D::Minus1, 2 * hidden, hidden)?;

        // [B, S, E] -> [B, n_head, S, head_dim]
        let q = q
            .reshape((b_sz, seq_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, seq_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b_sz, seq_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // When caching is disabled the cache is neither read nor written, so
        // every call attends over exactly the supplied sequence.
        let (k, v) = if use_cache {
            let (k, v) = match &self.kv_cache {
                Some((prev_k, prev_v)) => (
                    Tensor::cat(&[prev_k, &k], 2)?,
                    Tensor::cat(&[prev_v, &v], 2)?,
                ),
                None => (k, v),
            };
            self.kv_cache = Some((k.clone(), v.clone()));
            (k, v)
        } else {
            (k, v)
        };

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * scale)?;
        let attn_weights = match mask {
            Some(mask) => attn_weights.broadcast_add(mask)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [B, n_head, S, head_dim] -> [B, S, E]
        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b_sz, seq_len, ()))?;

        self.c_proj.forward(&attn_output)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    act: Activation,
}

#[derive(Debug, Clone, Copy)]
enum Activation {
    GeluTanh,
    GeluErf,
}

impl Activation {
    fn from_config(config: &Config) -> Result<Self> {
        match config.activation_function.as_str() {
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Self::GeluTanh),
            "gelu" => Ok(Self::GeluErf),
            act => candle_core::bail!("unsupported activation function: {act}"),
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::GeluTanh => x.gelu(),
            Self::GeluErf => x.gelu_erf(),
        }
    }
}

impl Mlp {
    fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let c_fc = conv1d_linear(config.n_embd, config.intermediate_size(), vb.pp("c_fc"))?;
        let c_proj = conv1d_linear(config.intermediate_size(), config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            act: Activation::from_config(config)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c_fc.forward(x)?;
        let x = self.act.forward(&x)?;
        self.c_proj.forward(&x)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let ln_1 = candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?;
        let attn = Attention::new(config, vb.pp("attn"))?;
        let ln_2 = candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_2"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;
        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    fn forward(&mut self, hidden_states: &Tensor, mask: Option<&Tensor>, use_cache: bool) -> Result<Tensor> {
        let residual = hidden_states;
        let hidden_states = self.ln_1.forward(hidden_states)?;
        let hidden_states = self.attn.forward(&hidden_states, mask, use_cache)?;
        let hidden_states = (residual + hidden_states)?;

        let residual = &hidden_states;
        let normed = self.ln_2.forward(&hidden_states)?;
        let mlp_out = self.mlp.forward(&normed)?;
        residual + mlp_out
    }

    fn clear_kv_cache(&mut self) {
        self.attn.clear_kv_cache();
    }
}

/// GPT-2 with a language-modeling head tied to the token embedding.
///
/// `forward` returns the logits for **every** position, `[B, S, vocab]`,
/// rather than only the last one: the export contract needs next-token
/// scores at all positions simultaneously.
pub struct Gpt2Model {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: Config,
    dtype: DType,
    device: Device,
}

impl Gpt2Model {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let dtype = vb.dtype();
        let device = vb.device().clone();
        let wte = candle_nn::embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        let blocks_vb = vb.pp("h");
        for i in 0..config.n_layer {
            blocks.push(Block::new(config, blocks_vb.pp(i))?);
        }

        let ln_f = candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        // Tied LM head: reuse the token embedding matrix.
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: config.clone(),
            dtype,
            device,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Full-sequence forward pass.
    ///
    /// `input_ids` and `position_ids` are `[B, S]` index tensors of identical
    /// shape; a shape mismatch fails in the embedding sum. With
    /// `use_cache = false` the call is a pure function of its inputs.
    pub fn forward(&mut self, input_ids: &Tensor, position_ids: &Tensor, use_cache: bool) -> Result<Tensor> {
        let (_b_sz, seq_len) = input_ids.dims2()?;

        let tok_emb = self.wte.forward(input_ids)?.to_dtype(self.dtype)?;
        let pos_emb = self.wpe.forward(position_ids)?.to_dtype(self.dtype)?;
        // Plain (non-broadcast) add: rejects mismatched sequence lengths.
        let mut hidden_states = (tok_emb + pos_emb)?;

        let past_len = if use_cache {
            self.blocks.first().map_or(0, |b| b.attn.cache_len())
        } else {
            0
        };
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, past_len, input_ids.device(), self.dtype)?)
        } else {
            None
        };

        for block in self.blocks.iter_mut() {
            hidden_states = block.forward(&hidden_states, mask.as_ref(), use_cache)?;
        }

        let hidden_states = self.ln_f.forward(&hidden_states)?;
        self.lm_head.forward(&hidden_states)
    }

    pub fn clear_kv_cache(&mut self) {
        for block in self.blocks.iter_mut() {
            block.clear_kv_cache();
        }
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }
}

/// Build a `[1, 1, seq_len, past_len + seq_len]` additive causal mask:
/// 0.0 where attention is allowed, -1e9 where it is masked.
fn causal_mask(seq_len: usize, past_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let total_len = past_len + seq_len;
    let mut mask_data = vec![0f32; seq_len * total_len];
    for i in 0..seq_len {
        for j in (past_len + i + 1)..total_len {
            mask_data[i * total_len + j] = -1e9;
        }
    }
    let mask = Tensor::from_vec(mask_data, (seq_len, total_len), device)?.to_dtype(dtype)?;
    mask.unsqueeze(0)?.unsqueeze(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use candle_core::Device;

    #[test]
    fn forward_shape_covers_all_positions() {
        let device = Device::Cpu;
        let config = testing::tiny_config();
        let mut model = testing::tiny_model(&config, &device).unwrap();

        let input_ids = Tensor::new(&[[1u32, 2, 3, 4, 5]], &device).unwrap();
        let position_ids = Tensor::new(&[[0u32, 1, 2, 3, 4]], &device).unwrap();
        let logits = model.forward(&input_ids, &position_ids, false).unwrap();
        assert_eq!(logits.dims3().unwrap(), (1, 5, config.vocab_size));
    }

    #[test]
    fn mismatched_position_length_fails() {
        let device = Device::Cpu;
        let config = testing::tiny_config();
        let mut model = testing::tiny_model(&config, &device).unwrap();

        let input_ids = Tensor::new(&[[1u32, 2, 3, 4, 5]], &device).unwrap();
        let position_ids = Tensor::new(&[[0u32, 1, 2]], &device).unwrap();
        assert!(model.forward(&input_ids, &position_ids, false).is_err());
    }

    #[test]
    fn no_cache_forward_leaves_no_state() {
        let device = Device::Cpu;
        let config = testing::tiny_config();
        let mut model = testing::tiny_model(&config, &device).unwrap();

        let input_ids = Tensor::new(&[[3u32, 1, 4]], &device).unwrap();
        let position_ids = Tensor::new(&[[0u32, 1, 2]], &device).unwrap();
        model.forward(&input_ids, &position_ids, false).unwrap();
        for block in &model.blocks {
            assert_eq!(block.attn.cache_len(), 0);
        }
    }

    #[test]
    fn cached_forward_accumulates_state() {
        let device = Device::Cpu;
        let config = testing::tiny_config();
        let mut model = testing::tiny_model(&config, &device).unwrap();

        let input_ids = Tensor::new(&[[3u32, 1, 4]], &device).unwrap();
        let position_ids = Tensor::new(&[[0u32, 1, 2]], &device).unwrap();
        model.forward(&input_ids, &position_ids, true).unwrap();
        assert_eq!(model.blocks[0].attn.cache_len(), 3);
        model.clear_kv_cache();
        assert_eq!(model.blocks[0].attn.cache_len(), 0);
    }

    #[test]
    fn batched_input_is_supported() {
        let device = Device::Cpu;
        let config = testing::tiny_config();
        let mut model = testing::tiny_model(&config, &device).unwrap();

        let input_ids = Tensor::new(&[[1u32, 2], [3u32, 4]], &device).unwrap();
        let position_ids = Tensor::new(&[[0u32, 1], [0u32, 1]], &device).unwrap();
        let logits = model.forward(&input_ids, &position_ids, false).unwrap();
        assert_eq!(logits.dims3().unwrap(), (2, 2, config.vocab_size));
    }
}
