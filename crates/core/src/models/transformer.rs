//! Temporal transformer: pre-norm multi-query attention and feed-forward
//! layers, each optionally modulated by the next conditioning closure.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::conditioning::{next_cond_fn, CondCursor};
use crate::layers::{AttentionInputs, FeedForward, TransformerAttention};

#[derive(Clone, Debug)]
struct TransformerLayer {
    attn: TransformerAttention,
    ff: FeedForward,
}

#[derive(Clone, Debug)]
pub struct Transformer {
    layers: Vec<TransformerLayer>,
    dim: usize,
}

impl Transformer {
    pub fn new(
        dim: usize,
        dim_head: usize,
        heads: usize,
        depth: usize,
        attn_dropout: f64,
        ff_dropout: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("layers");
        let layers = (0..depth)
            .map(|i| -> Result<TransformerLayer> {
                let vb = vb.pp(i);
                Ok(TransformerLayer {
                    attn: TransformerAttention::new(
                        dim,
                        false,
                        dim_head,
                        None,
                        heads,
                        false,
                        attn_dropout,
                        vb.pp("attn"),
                    )?,
                    ff: FeedForward::new(dim, 4.0, ff_dropout, vb.pp("ff"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers, dim })
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Conditioning closures consumed per call when a cursor is supplied.
    pub fn num_cond_sites(&self) -> usize {
        self.layers.len() * 2
    }

    /// `(b, n, dim)` → `(b, n, dim)`.
    ///
    /// `attn_mask` is boolean, broadcastable to `(b, heads, n, n)`, non-zero = may attend.
    pub fn forward(
        &self,
        xs: &Tensor,
        mut cond: Option<&mut CondCursor<'_>>,
        attn_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (_, _, dim) = xs.dims3()?;
        if dim != self.dim {
            candle_core::bail!("transformer built for width {}, got {dim}", self.dim);
        }
        let mut xs = xs.clone();
        for layer in &self.layers {
            let inputs = AttentionInputs {
                attn_mask,
                cond_fn: next_cond_fn(&mut cond)?,
                ..Default::default()
            };
            xs = (layer.attn.forward(&xs, inputs, train)? + &xs)?;
            let ff_cond = next_cond_fn(&mut cond)?;
            xs = (layer.ff.forward(&xs, ff_cond, train)? + &xs)?;
        }
        Ok(xs)
    }
}
