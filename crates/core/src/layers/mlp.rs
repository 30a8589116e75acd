use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use super::normalization::{layer_norm, LayerNorm};
use crate::conditioning::CondFn;

/// Pre-norm GELU feed-forward: LayerNorm → (cond) → Linear → GELU → Dropout → Linear → Dropout.
///
/// Works on any rank; the trailing axis is the feature axis.
#[derive(Clone, Debug)]
pub struct FeedForward {
    norm: LayerNorm,
    proj_in: Linear,
    proj_out: Linear,
    dropout: Dropout,
    dim: usize,
}

impl FeedForward {
    /// `inner = int(dim * mult)`, so fractional multipliers are allowed.
    pub fn new(dim: usize, mult: f64, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let inner = (dim as f64 * mult) as usize;
        if inner == 0 {
            candle_core::bail!("feed-forward of width {dim} with mult {mult} has no hidden units");
        }
        let norm = layer_norm(dim, vb.pp("norm"))?;
        let proj_in = linear(dim, inner, vb.pp("net.0"))?;
        let proj_out = linear(inner, dim, vb.pp("net.3"))?;
        Ok(Self {
            norm,
            proj_in,
            proj_out,
            dropout: Dropout::new(dropout as f32),
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn forward(&self, xs: &Tensor, cond_fn: Option<&CondFn>, train: bool) -> Result<Tensor> {
        let dims = xs.dims().to_vec();
        let mut hidden = self.norm.forward(xs)?;
        if let Some(cond_fn) = cond_fn {
            hidden = cond_fn(&hidden)?;
        }
        // linear layers take at most 4-d inputs; window tensors are 6-d
        let hidden = hidden.reshape(((), self.dim))?;
        let hidden = self.proj_in.forward(&hidden)?.gelu_erf()?;
        let hidden = self.dropout.forward(&hidden, train)?;
        let hidden = self.proj_out.forward(&hidden)?;
        let hidden = self.dropout.forward(&hidden, train)?;
        hidden.reshape(dims)
    }
}
