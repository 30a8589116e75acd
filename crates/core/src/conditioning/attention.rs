//! Cross-attention text conditioner.
//!
//! Each site lets the hiddens attend to the instruction tokens plus one
//! learned null key/value. Dropping an item's condition masks all of its text
//! tokens, leaving only the null slot.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Init, Linear, VarBuilder};

use super::{
    keep_mask, repeat_batch_major, resolve_text, CondFn, CondFns, Conditioner, TextEncoder,
    TextInput,
};
use crate::config::TextConditionerConfig;
use crate::layers::{layer_norm, masked_fill, LayerNorm};

#[derive(Clone, Debug)]
struct CrossAttentionHead {
    norm: LayerNorm,
    to_q: Linear,
    to_kv: Linear,
    /// `(2, heads * dim_head)`
    null_kv: Tensor,
    to_out: Linear,
    heads: usize,
    dim_head: usize,
    scale: f64,
    channel_first: bool,
}

impl CrossAttentionHead {
    fn new(
        dim: usize,
        text_dim: usize,
        heads: usize,
        dim_head: usize,
        channel_first: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner = heads * dim_head;
        let norm = layer_norm(dim, vb.pp("norm"))?;
        let to_q = linear_no_bias(dim, inner, vb.pp("to_q"))?;
        let to_kv = linear_no_bias(text_dim, inner * 2, vb.pp("to_kv"))?;
        let null_kv = vb.get_with_hints(
            (2, inner),
            "null_kv",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let out_w = vb
            .pp("to_out")
            .get_with_hints((dim, inner), "weight", Init::Const(0.0))?;
        Ok(Self {
            norm,
            to_q,
            to_kv,
            null_kv,
            to_out: Linear::new(out_w, None),
            heads,
            dim_head,
            scale: (dim_head as f64).powf(-0.5),
            channel_first,
        })
    }

    /// `(b, s, heads * dim_head)` → `(b, heads, s, dim_head)`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, s, _) = xs.dims3()?;
        xs.reshape((b, s, self.heads, self.dim_head))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Hiddens of any layout attend to `text (b, n, d)` under `mask (b, n)`.
    fn forward(&self, xs: &Tensor, text: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let dims = xs.dims().to_vec();
        if dims.len() < 2 {
            candle_core::bail!(
                "cross-attention conditioning needs a batched input, got {dims:?}"
            );
        }
        let batch = dims[0];
        let tokens = if self.channel_first {
            xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?
        } else {
            xs.reshape((batch, (), dims[dims.len() - 1]))?
        };
        let seq = tokens.dim(1)?;

        let normed = self.norm.forward(&tokens)?;
        let q = self.split_heads(&self.to_q.forward(&normed)?)?;
        let q = (q * self.scale)?;

        let inner = self.heads * self.dim_head;
        let kv = self.to_kv.forward(text)?;
        let null_kv = self.null_kv.to_dtype(kv.dtype())?;
        let null_k = null_kv.get(0)?.reshape((1, 1, inner))?.broadcast_as((batch, 1, inner))?;
        let null_v = null_kv.get(1)?.reshape((1, 1, inner))?.broadcast_as((batch, 1, inner))?;
        let k = Tensor::cat(&[&null_k, &kv.narrow(D::Minus1, 0, inner)?], 1)?;
        let v = Tensor::cat(&[&null_v, &kv.narrow(D::Minus1, inner, inner)?], 1)?;
        let k = self.split_heads(&k)?;
        let v = self.split_heads(&v)?;

        let sim = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let null_slot = Tensor::ones((batch, 1), DType::U8, mask.device())?;
        let mask = Tensor::cat(&[&null_slot, mask], 1)?;
        let keys = mask.dim(1)?;
        let mask = mask
            .reshape((batch, 1, 1, keys))?
            .broadcast_as(sim.shape())?;
        let sim = masked_fill(&sim, &mask)?;

        let attn = candle_nn::ops::softmax_last_dim(&sim)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, inner))?;
        let out = self.to_out.forward(&out)?;

        let out = if self.channel_first {
            out.transpose(1, 2)?.contiguous()?.reshape(dims.as_slice())?
        } else {
            out.reshape(dims.as_slice())?
        };
        xs + out
    }
}

/// Conditioner whose sites cross-attend to the instruction tokens.
pub struct AttentionTextConditioner {
    heads: Vec<CrossAttentionHead>,
    text_encoder: Option<Box<dyn TextEncoder>>,
    text_embed_dim: usize,
}

impl AttentionTextConditioner {
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
        let vb_heads = vb.pp("cross_attns");
        let heads = hidden_dims
            .iter()
            .zip(channel_first.iter())
            .enumerate()
            .map(|(i, (&dim, &channel_first))| {
                CrossAttentionHead::new(
                    dim,
                    cfg.text_embed_dim,
                    cfg.attn_heads,
                    cfg.attn_dim_head,
                    channel_first,
                    vb_heads.pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            heads,
            text_encoder: None,
            text_embed_dim: cfg.text_embed_dim,
        })
    }

    pub fn with_text_encoder(mut self, encoder: Box<dyn TextEncoder>) -> Result<Self> {
        self.set_text_encoder(encoder)?;
        Ok(self)
    }
}

impl Conditioner for AttentionTextConditioner {
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
        let (embeds, mask) =
            resolve_text(input, self.text_encoder.as_deref(), self.text_embed_dim)?;
        let batch = embeds.dim(0)?;
        let keep = keep_mask(batch, cond_drop_prob, embeds.device())?;
        let mask = mask.broadcast_mul(&keep.unsqueeze(1)?)?;

        let mut fns: Vec<CondFn> = Vec::with_capacity(self.heads.len());
        for (head, &repeats) in self.heads.iter().zip(repeat_batch.iter()) {
            let text = repeat_batch_major(&embeds, repeats)?;
            let mask = repeat_batch_major(&mask, repeats)?;
            let head = head.clone();
            fns.push(Box::new(move |xs: &Tensor| head.forward(xs, &text, &mask)));
        }
        Ok(CondFns::new(fns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn cfg() -> TextConditionerConfig {
        TextConditionerConfig {
            text_embed_dim: 8,
            film_hidden_mult: 4,
            attn_heads: 2,
            attn_dim_head: 4,
        }
    }

    fn randomize_out(varmap: &VarMap) {
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            if name.contains("to_out") {
                let value = Tensor::randn(0f32, 0.5, var.shape(), var.device()).unwrap();
                var.set(&value).unwrap();
            }
        }
    }

    #[test]
    fn fresh_conditioner_is_identity_and_keeps_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cond = AttentionTextConditioner::new(&[6, 4], &[true, false], &cfg(), vb).unwrap();

        let embeds = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        let fns = cond
            .condition(TextInput::Embeds(&embeds), 0.0, &[2, 1])
            .unwrap();

        let image = Tensor::randn(0f32, 1.0, (4, 6, 3, 3), &device).unwrap();
        let out = fns.get(0).unwrap()(&image).unwrap();
        assert_eq!(out.dims(), &[4, 6, 3, 3]);
        let diff = (out - &image).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);

        let tokens = Tensor::randn(0f32, 1.0, (2, 5, 4), &device).unwrap();
        let out = fns.get(1).unwrap()(&tokens).unwrap();
        assert_eq!(out.dims(), &[2, 5, 4]);
    }

    #[test]
    fn dropped_condition_ignores_text() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cond = AttentionTextConditioner::new(&[4], &[false], &cfg(), vb).unwrap();
        randomize_out(&varmap);

        let tokens = Tensor::randn(0f32, 1.0, (2, 3, 4), &device).unwrap();
        let a = Tensor::randn(0f32, 1.0, (2, 5, 8), &device).unwrap();
        let b = Tensor::randn(0f32, 1.0, (2, 5, 8), &device).unwrap();

        let run = |embeds: &Tensor, p: f64| {
            let fns = cond.condition(TextInput::Embeds(embeds), p, &[1]).unwrap();
            fns.get(0).unwrap()(&tokens).unwrap()
        };
        let diff = (run(&a, 1.0) - run(&b, 1.0))
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);

        let diff = (run(&a, 0.0) - run(&b, 0.0))
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 1e-6);
    }

    #[test]
    fn mismatched_layouts_are_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(AttentionTextConditioner::new(&[4, 4], &[true], &cfg(), vb).is_err());
    }
}
