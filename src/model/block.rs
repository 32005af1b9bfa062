use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, ops, LayerNorm, Module, VarBuilder};

use super::attention::CausalSelfAttention;
use super::conv1d::{conv1d, Conv1D};
use crate::config::ModelConfig;

/// MLP (Multi-Layer Perceptron) module
pub struct MLP {
    c_fc: Conv1D,
    c_proj: Conv1D,
    dropout_p: f32,
}

impl MLP {
    pub fn new(n_embd: usize, n_inner: usize, dropout_p: f32, vb: VarBuilder) -> Result<Self> {
        let c_fc = conv1d(n_embd, n_inner, vb.pp("c_fc"))?;
        let c_proj = conv1d(n_inner, n_embd, vb.pp("c_proj"))?;

        Ok(Self {
            c_fc,
            c_proj,
            dropout_p,
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        // GPT-2 uses the tanh approximation
        let x = self.c_fc.forward(x)?.gelu()?;
        let x = self.c_proj.forward(&x)?;

        if training && self.dropout_p > 0.0 {
            ops::dropout(&x, self.dropout_p)
        } else {
            Ok(x)
        }
    }
}

/// Pre-norm transformer block
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        let eps = config.layer_norm_epsilon;

        let ln_1 = layer_norm(n_embd, eps, vb.pp("ln_1"))?;
        let attn = CausalSelfAttention::new(
            n_embd,
            config.n_head,
            config.n_positions(),
            config.attn_pdrop,
            config.resid_pdrop,
            vb.pp("attn"),
        )?;
        let ln_2 = layer_norm(n_embd, eps, vb.pp("ln_2"))?;
        let mlp = MLP::new(n_embd, config.n_inner(), config.resid_pdrop, vb.pp("mlp"))?;

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        let attn_out = self.attn.forward(&self.ln_1.forward(x)?, training)?;
        let x = (x + attn_out)?;

        let mlp_out = self.mlp.forward(&self.ln_2.forward(&x)?, training)?;
        x + mlp_out
    }
}
