use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{ops, Module, VarBuilder};

use super::conv1d::{conv1d, Conv1D};

/// Causal self-attention layer
pub struct CausalSelfAttention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    /// 1 above the diagonal, where attention is forbidden
    mask: Tensor,
    attn_dropout_p: f32,
    resid_dropout_p: f32,
}

impl CausalSelfAttention {
    pub fn new(
        n_embd: usize,
        n_head: usize,
        n_positions: usize,
        attn_dropout_p: f32,
        resid_dropout_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if n_embd % n_head != 0 {
            candle_core::bail!("n_embd {n_embd} must be divisible by n_head {n_head}");
        }

        let c_attn = conv1d(n_embd, 3 * n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(n_embd, n_embd, vb.pp("c_proj"))?;

        let mask: Vec<u8> = (0..n_positions)
            .flat_map(|i| (0..n_positions).map(move |j| u8::from(j > i)))
            .collect();
        let mask = Tensor::from_vec(mask, (n_positions, n_positions), vb.device())?;

        Ok(Self {
            c_attn,
            c_proj,
            n_head,
            mask,
            attn_dropout_p,
            resid_dropout_p,
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let head_dim = c / self.n_head;

        // (B, T, 3, H, D) -> three (B, H, T, D)
        let qkv = self.c_attn.forward(x)?.reshape((b, t, 3, self.n_head, head_dim))?;
        let q = qkv.i((.., .., 0))?.transpose(1, 2)?.contiguous()?;
        let k = qkv.i((.., .., 1))?.transpose(1, 2)?.contiguous()?;
        let v = qkv.i((.., .., 2))?.transpose(1, 2)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let att = (q.matmul(&k.t()?.contiguous()?)? * scale)?;

        let mask = self
            .mask
            .narrow(0, 0, t)?
            .narrow(1, 0, t)?
            .broadcast_as(att.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, att.device())?
            .to_dtype(att.dtype())?
            .broadcast_as(att.shape())?;
        let att = mask.where_cond(&neg_inf, &att)?;
        let att = ops::softmax_last_dim(&att)?;

        let att = if training && self.attn_dropout_p > 0.0 {
            ops::dropout(&att, self.attn_dropout_p)?
        } else {
            att
        };

        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.contiguous()?.reshape((b, t, c))?;
        let y = self.c_proj.forward(&y)?;

        if training && self.resid_dropout_p > 0.0 {
            ops::dropout(&y, self.resid_dropout_p)
        } else {
            Ok(y)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn earlier_positions_ignore_later_tokens() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = CausalSelfAttention::new(8, 2, 16, 0.0, 0.0, vb)?;

        let a = Tensor::randn(0f32, 1.0, (1, 5, 8), &device)?;
        let tail = Tensor::randn(0f32, 1.0, (1, 1, 8), &device)?;
        let b = Tensor::cat(&[a.narrow(1, 0, 4)?, tail], 1)?;

        let ya = attn.forward(&a, false)?.narrow(1, 0, 4)?;
        let yb = attn.forward(&b, false)?.narrow(1, 0, 4)?;
        let diff = (ya - yb)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "prefix changed by {diff}");
        Ok(())
    }
}
