use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Dropout, Linear, VarBuilder};

use super::mask::{causal_mask, masked_fill};
use super::normalization::{layer_norm, LayerNorm};
use crate::conditioning::CondFn;

/// Optional inputs of [`TransformerAttention::forward`].
#[derive(Clone, Copy, Default)]
pub struct AttentionInputs<'a> {
    /// `(b, j, dim_context)`; keys/values come from `x` itself when absent.
    pub context: Option<&'a Tensor>,
    /// Key padding mask `(b, j)`, non-zero = may attend.
    pub mask: Option<&'a Tensor>,
    /// Additive bias broadcastable to `(b, heads, i, j)`.
    pub attn_bias: Option<&'a Tensor>,
    /// Boolean mask broadcastable to `(b, heads, i, j)`, non-zero = may attend.
    pub attn_mask: Option<&'a Tensor>,
    /// Modulation applied to the normalized queries' input.
    pub cond_fn: Option<&'a CondFn>,
}

/// Repeat a single key/value head across all query heads.
///
/// `[b, kv_heads, s, d]` → `[b, kv_heads * n_rep, s, d]`
pub fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, kv_heads, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((b, kv_heads, n_rep, s, d))?
        .reshape((b, kv_heads * n_rep, s, d))
}

/// Multi-query attention: `heads` query heads share one key/value head.
#[derive(Clone, Debug)]
pub struct TransformerAttention {
    norm: LayerNorm,
    context_norm: Option<LayerNorm>,
    to_q: Linear,
    to_kv: Linear,
    to_out: Linear,
    attn_dropout: Dropout,
    out_dropout: Dropout,
    heads: usize,
    dim_head: usize,
    scale: f64,
    causal: bool,
}

impl TransformerAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        causal: bool,
        dim_head: usize,
        dim_context: Option<usize>,
        heads: usize,
        norm_context: bool,
        dropout: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if heads == 0 || dim_head == 0 {
            candle_core::bail!("attention needs at least one head of non-zero width");
        }
        let inner = heads * dim_head;
        let dim_context = dim_context.unwrap_or(dim);
        let norm = layer_norm(dim, vb.pp("norm"))?;
        let context_norm = if norm_context {
            Some(layer_norm(dim_context, vb.pp("context_norm"))?)
        } else {
            None
        };
        Ok(Self {
            norm,
            context_norm,
            to_q: linear_no_bias(dim, inner, vb.pp("to_q"))?,
            to_kv: linear_no_bias(dim_context, dim_head * 2, vb.pp("to_kv"))?,
            to_out: linear_no_bias(inner, dim, vb.pp("to_out"))?,
            attn_dropout: Dropout::new(dropout as f32),
            out_dropout: Dropout::new(dropout as f32),
            heads,
            dim_head,
            scale: (dim_head as f64).powf(-0.5),
            causal,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn dim_head(&self) -> usize {
        self.dim_head
    }

    /// `x (b, i, dim)` → `(b, i, dim)`.
    pub fn forward(
        &self,
        x: &Tensor,
        inputs: AttentionInputs<'_>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, i, _) = x.dims3()?;

        let kv_input = match inputs.context {
            Some(context) => match &self.context_norm {
                Some(norm) => norm.forward(context)?,
                None => context.clone(),
            },
            None => x.clone(),
        };

        let mut hidden = self.norm.forward(x)?;
        if let Some(cond_fn) = inputs.cond_fn {
            hidden = cond_fn(&hidden)?;
        }

        let q = self
            .to_q
            .forward(&hidden)?
            .reshape((b, i, self.heads, self.dim_head))?
            .transpose(1, 2)?
            .contiguous()?;
        let q = (q * self.scale)?;

        let kv = self.to_kv.forward(&kv_input)?;
        let j = kv.dim(1)?;
        let k = kv.narrow(D::Minus1, 0, self.dim_head)?.unsqueeze(1)?.contiguous()?;
        let v = kv
            .narrow(D::Minus1, self.dim_head, self.dim_head)?
            .unsqueeze(1)?
            .contiguous()?;
        let k = repeat_kv(k, self.heads)?;
        let v = repeat_kv(v, self.heads)?;

        let mut sim = q.matmul(&k.t()?)?;
        if let Some(bias) = inputs.attn_bias {
            sim = sim.broadcast_add(&bias.to_dtype(sim.dtype())?)?;
        }
        if let Some(attn_mask) = inputs.attn_mask {
            sim = masked_fill(&sim, attn_mask)?;
        }
        if let Some(mask) = inputs.mask {
            sim = masked_fill(&sim, &mask.reshape((b, 1, 1, j))?)?;
        }
        if self.causal {
            let causal = if j >= i {
                causal_mask(i, j - i, x.device())?
            } else {
                // more queries than keys: query r sees keys c with c + i <= r + j
                let mask: Vec<u8> = (0..i)
                    .flat_map(|r| (0..j).map(move |c| u8::from(c + i <= r + j)))
                    .collect();
                Tensor::from_vec(mask, (i, j), x.device())?
            };
            sim = masked_fill(&sim, &causal)?;
        }

        let attn = candle_nn::ops::softmax_last_dim(&sim)?;
        let attn = self.attn_dropout.forward(&attn, train)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, i, self.heads * self.dim_head))?;
        let out = self.to_out.forward(&out)?;
        self.out_dropout.forward(&out, train)
    }
}
