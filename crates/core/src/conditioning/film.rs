//! FiLM text conditioner: pooled instruction embedding → per-site scale/shift.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Init, Linear, VarBuilder};

use super::{
    keep_mask, masked_mean, repeat_batch_major, resolve_text, CondFn, CondFns, Conditioner,
    TextEncoder, TextInput,
};
use crate::config::TextConditionerConfig;

/// Apply `x * (scale + 1) + shift`.
///
/// `scale` and `shift` are `(batch, channels)`. With `channel_first` the
/// channel axis of `x` is axis 1 (`(b, c, h, w)`), otherwise the last axis
/// (`(b, n, c)`).
pub fn film_modulate(
    xs: &Tensor,
    scale: &Tensor,
    shift: &Tensor,
    channel_first: bool,
) -> Result<Tensor> {
    let (batch, channels) = scale.dims2()?;
    let rank = xs.rank();
    if rank < 2 {
        candle_core::bail!("film expects at least a 2-d input, got {:?}", xs.dims());
    }
    let channel_axis = if channel_first { 1 } else { rank - 1 };
    if xs.dim(0)? != batch || xs.dim(channel_axis)? != channels {
        candle_core::bail!(
            "film condition ({batch}, {channels}) does not match hiddens {:?} (channel_first={channel_first})",
            xs.dims()
        );
    }
    let mut shape = vec![1usize; rank];
    shape[0] = batch;
    shape[channel_axis] = channels;
    let scale = (scale + 1.0)?.reshape(shape.as_slice())?;
    let shift = shift.reshape(shape.as_slice())?;
    xs.broadcast_mul(&scale)?.broadcast_add(&shift)
}

/// Two-layer head producing `(scale, shift)` for one site.
///
/// The output layer starts at zero so a fresh conditioner is an identity.
#[derive(Clone, Debug)]
struct FilmHead {
    proj_in: Linear,
    proj_out: Linear,
    hidden_dim: usize,
}

impl FilmHead {
    fn new(text_dim: usize, hidden_dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let inner = hidden_dim * mult;
        let proj_in = linear(text_dim, inner, vb.pp("net.0"))?;
        let vb_out = vb.pp("net.2");
        let w = vb_out.get_with_hints((hidden_dim * 2, inner), "weight", Init::Const(0.0))?;
        let b = vb_out.get_with_hints(hidden_dim * 2, "bias", Init::Const(0.0))?;
        Ok(Self {
            proj_in,
            proj_out: Linear::new(w, Some(b)),
            hidden_dim,
        })
    }

    fn forward(&self, cond: &Tensor) -> Result<(Tensor, Tensor)> {
        let out = self.proj_in.forward(cond)?.silu()?;
        let out = self.proj_out.forward(&out)?;
        let scale = out.narrow(1, 0, self.hidden_dim)?;
        let shift = out.narrow(1, self.hidden_dim, self.hidden_dim)?;
        Ok((scale, shift))
    }
}

/// FiLM conditioner with one head per conditioning site.
pub struct TextConditioner {
    heads: Vec<FilmHead>,
    channel_first: Vec<bool>,
    null_text_embed: Tensor,
    text_encoder: Option<Box<dyn TextEncoder>>,
    text_embed_dim: usize,
}

impl TextConditioner {
    /// `hidden_dims[i]` is the channel width seen at site `i`;
    /// `channel_first[i]` tells whether that site is `(b, c, ..)` or `(b, .., c)`.
    pub fn new(
        hidden_dims: &[usize],
        channel_first: &[bool],
        cfg: &TextConditionerConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if hidden_dims.len() != channel_first.len() {
            candle_core::bail!(
                "{} hidden dims but {} channel layouts",
                hidden_dims.len(),
                channel_first.len()
            );
        }
        let vb_heads = vb.pp("film");
        let heads = hidden_dims
            .iter()
            .enumerate()
            .map(|(i, &dim)| {
                FilmHead::new(
                    cfg.text_embed_dim,
                    dim,
                    cfg.film_hidden_mult,
                    vb_heads.pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let null_text_embed = vb.get_with_hints(
            cfg.text_embed_dim,
            "null_text_embed",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;

        Ok(Self {
            heads,
            channel_first: channel_first.to_vec(),
            null_text_embed,
            text_encoder: None,
            text_embed_dim: cfg.text_embed_dim,
        })
    }

    /// Attach the encoder used for raw-text instructions.
    pub fn with_text_encoder(mut self, encoder: Box<dyn TextEncoder>) -> Result<Self> {
        self.set_text_encoder(encoder)?;
        Ok(self)
    }

    /// Pooled `(batch, text_embed_dim)` condition; dropped items get the null embedding.
    fn pooled_condition(&self, input: TextInput<'_>, cond_drop_prob: f64) -> Result<Tensor> {
        let (embeds, mask) =
            resolve_text(input, self.text_encoder.as_deref(), self.text_embed_dim)?;
        let pooled = masked_mean(&embeds, &mask)?;
        let batch = pooled.dim(0)?;

        let keep = keep_mask(batch, cond_drop_prob, pooled.device())?
            .unsqueeze(1)?
            .broadcast_as(pooled.shape())?;
        let null = self
            .null_text_embed
            .to_dtype(pooled.dtype())?
            .unsqueeze(0)?
            .broadcast_as(pooled.shape())?;
        keep.where_cond(&pooled, &null)
    }
}

impl Conditioner for TextConditioner {
    fn num_sites(&self) -> usize {
        self.heads.len()
    }

    fn text_embed_dim(&self) -> usize {
        self.text_embed_dim
    }

    fn embed_texts(&self, texts: &[&str]) -> Result<Tensor> {
        match &self.text_encoder {
            Some(encoder) => Ok(encoder.encode(texts)?.0),
            None => candle_core::bail!("no text encoder attached to the conditioner"),
        }
    }

    fn set_text_encoder(&mut self, encoder: Box<dyn TextEncoder>) -> Result<()> {
        if encoder.dim() != self.text_embed_dim {
            candle_core::bail!(
                "text encoder width {} does not match conditioner width {}",
                encoder.dim(),
                self.text_embed_dim
            );
        }
        self.text_encoder = Some(encoder);
        Ok(())
    }

    fn condition(
        &self,
        input: TextInput<'_>,
        cond_drop_prob: f64,
        repeat_batch: &[usize],
    ) -> Result<CondFns> {
        if repeat_batch.len() != self.heads.len() {
            candle_core::bail!(
                "repeat_batch has {} entries for {} conditioning sites",
                repeat_batch.len(),
                self.heads.len()
            );
        }
        let cond = self.pooled_condition(input, cond_drop_prob)?;

        let mut fns: Vec<CondFn> = Vec::with_capacity(self.heads.len());
        for ((head, &channel_first), &repeats) in self
            .heads
            .iter()
            .zip(self.channel_first.iter())
            .zip(repeat_batch.iter())
        {
            let (scale, shift) = head.forward(&cond)?;
            let scale = repeat_batch_major(&scale, repeats)?;
            let shift = repeat_batch_major(&shift, repeats)?;
            fns.push(Box::new(move |xs: &Tensor| {
                film_modulate(xs, &scale, &shift, channel_first)
            }));
        }
        Ok(CondFns::new(fns))
    }
}
