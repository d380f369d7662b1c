//! Cache-disabling adapter over the GPT-2 model.
//!
//! The exported graph must be a pure function of `(input_ids, position_ids)`
//! with no hidden recurrent state, so every forward pass here drops any
//! previously accumulated KV cache and instructs the model not to build one.

use candle_core::{Result, Tensor};

use crate::models::gpt2::Gpt2Model;

/// Presents the wrapped model as `(input_ids, position_ids) -> logits`.
///
/// Holds no state beyond the model itself; two consecutive calls with
/// identical inputs produce identical outputs.
pub struct StatelessLm {
    model: Gpt2Model,
}

impl StatelessLm {
    pub fn new(model: Gpt2Model) -> Self {
        Self { model }
    }

    /// Full-sequence forward with caching forced off.
    ///
    /// Returns `[B, S, vocab]` logits. Shape errors propagate unchanged
    /// from the underlying model.
    pub fn forward(&mut self, input_ids: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        // A cache left over from an earlier cached call must not leak in.
        self.model.clear_kv_cache();
        self.model.forward(input_ids, position_ids, false)
    }

    pub fn model(&self) -> &Gpt2Model {
        &self.model
    }

    pub fn into_inner(self) -> Gpt2Model {
        self.model
    }
}
