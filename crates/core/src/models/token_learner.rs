//! TokenLearner (v1.1): compresses a spatial map into a few learned tokens.
//!
//! The map is replicated once per output token, a grouped MLP of 1x1
//! convolutions produces one spatial attention map per token, and each token
//! is the spatial mean of the attention-weighted map.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

#[derive(Clone, Debug)]
pub struct TokenLearner {
    proj_in: Conv2d,
    proj_out: Conv2d,
    dim: usize,
    num_output_tokens: usize,
}

impl TokenLearner {
    pub fn new(dim: usize, ff_mult: usize, num_output_tokens: usize, vb: VarBuilder) -> Result<Self> {
        if dim == 0 || ff_mult == 0 || num_output_tokens == 0 {
            candle_core::bail!(
                "token learner needs non-zero dim ({dim}), ff_mult ({ff_mult}) and tokens ({num_output_tokens})"
            );
        }
        let groups = num_output_tokens;
        let inner = dim * ff_mult * groups;
        let cfg = Conv2dConfig {
            groups,
            ..Default::default()
        };
        let proj_in = conv2d(dim * groups, inner, 1, cfg, vb.pp("net.0"))?;
        let proj_out = conv2d(inner, groups, 1, cfg, vb.pp("net.2"))?;
        Ok(Self {
            proj_in,
            proj_out,
            dim,
            num_output_tokens,
        })
    }

    pub fn num_output_tokens(&self) -> usize {
        self.num_output_tokens
    }

    /// `(.., c, h, w)` → `(.., c, num_output_tokens)`; any number of leading axes.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dims = xs.dims();
        if dims.len() < 3 {
            candle_core::bail!("token learner expects (.., c, h, w), got {dims:?}");
        }
        let (lead, tail) = dims.split_at(dims.len() - 3);
        let (c, h, w) = (tail[0], tail[1], tail[2]);
        if c != self.dim {
            candle_core::bail!("token learner built for {} channels, got {c}", self.dim);
        }
        let batch: usize = lead.iter().product();
        let g = self.num_output_tokens;

        let xs = xs.reshape((batch, c, h, w))?.repeat((1, g, 1, 1))?;
        let attn = self.proj_in.forward(&xs)?.gelu_erf()?;
        let attn = self.proj_out.forward(&attn)?.reshape((batch, 1, g, h, w))?;

        let xs = xs.reshape((batch, g, c, h, w))?.transpose(1, 2)?;
        let tokens = xs.broadcast_mul(&attn)?.mean((3, 4))?;

        let mut out_dims = lead.to_vec();
        out_dims.extend([c, g]);
        tokens.reshape(out_dims)
    }
}
