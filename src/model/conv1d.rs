use candle_core::{Result, Tensor};
use candle_nn::{init, Module, VarBuilder};

/// Dense layer with GPT-2's `(in, out)` weight layout.
///
/// GPT-2 checkpoints store their projections transposed relative to
/// `candle_nn::Linear`; keeping the stored layout lets pretrained weights load
/// without a copy and lets saved checkpoints round-trip to other GPT-2 tools.
#[derive(Debug, Clone)]
pub struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

pub fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Conv1D> {
    let weight = vb.get_with_hints(
        (in_dim, out_dim),
        "weight",
        init::Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", init::ZERO)?;
    Ok(Conv1D { weight, bias })
}

impl Module for Conv1D {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = match *x.dims() {
            [b1, b2, _, _] => self.weight.broadcast_left((b1, b2))?,
            [b, _, _] => self.weight.broadcast_left(b)?,
            _ => self.weight.clone(),
        };
        x.matmul(&w)?.broadcast_add(&self.bias)
    }
}
