use candle_core::{Result, Tensor, D};
use candle_nn::{init, layer_norm, ops, Embedding, LayerNorm, Linear, Module, VarBuilder};

use super::block::Block;
use crate::config::ModelConfig;

/// GPT-2 language model
pub struct GPT {
    wte: Embedding,
    wpe: Embedding,
    h: Vec<Block>,
    ln_f: LayerNorm,
    /// Shares its weight with `wte`
    lm_head: Linear,
    embd_pdrop: f32,
    config: ModelConfig,
}

fn embedding(in_size: usize, out_size: usize, vb: VarBuilder) -> Result<Embedding> {
    let embeddings = vb.get_with_hints(
        (in_size, out_size),
        "weight",
        init::Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        },
    )?;
    Ok(Embedding::new(embeddings, out_size))
}

impl GPT {
    /// Create the model; variables are named like the Hugging Face GPT-2 checkpoints
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions(), config.n_embd, vb.pp("wpe"))?;

        let h = (0..config.n_layer)
            .map(|i| Block::new(config, vb.pp(format!("h.{}", i))))
            .collect::<Result<Vec<_>>>()?;

        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        // Tied output projection: logits = x @ wte^T
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            h,
            ln_f,
            lm_head,
            embd_pdrop: config.embd_pdrop,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn n_positions(&self) -> usize {
        self.config.n_positions()
    }

    /// Forward pass over `(batch, seq)` token ids, returning `(batch, seq, vocab)` logits
    pub fn forward(&self, idx: &Tensor, training: bool) -> Result<Tensor> {
        let (_b, t) = idx.dims2()?;
        if t > self.n_positions() {
            candle_core::bail!(
                "sequence length {} exceeds maximum {}",
                t,
                self.n_positions()
            );
        }

        let tok_emb = self.wte.forward(idx)?;
        let pos = Tensor::arange(0u32, t as u32, idx.device())?;
        let pos_emb = self.wpe.forward(&pos)?;
        let mut x = tok_emb.broadcast_add(&pos_emb)?;

        if training && self.embd_pdrop > 0.0 {
            x = ops::dropout(&x, self.embd_pdrop)?;
        }

        for block in &self.h {
            x = block.forward(&x, training)?;
        }

        let x = self.ln_f.forward(&x)?;
        self.lm_head.forward(&x)
    }
}

/// Mean negative log likelihood over the positions where `mask` is 1.
///
/// `logits` is `(batch, seq, vocab)`, `targets` is `(batch, seq)` u32 and
/// `mask` is `(batch, seq)` f32.
pub fn masked_lm_loss(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let log_probs = ops::log_softmax(&logits.reshape((b * t, v))?, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.reshape((b * t, 1))?, 1)?
        .squeeze(1)?
        .neg()?;

    let mask = mask.reshape(b * t)?.to_dtype(nll.dtype())?;
    let total = (nll * &mask)?.sum_all()?;
    let count = mask.sum_all()?.maximum(1.0)?;
    total / count
}
