//! Text conditioning for the HLT model.
//!
//! A conditioner turns instructions (raw strings or precomputed embeddings)
//! into one modulation closure per conditioning site. The closures are built
//! once per forward call and consumed in order through a [`CondCursor`]:
//!
//! ```text
//! instructions ──► Conditioner::condition ──► CondFns [site 0, site 1, ..]
//!                                                │
//!             MaxViT blocks take sites 0..k ◄────┤
//!   temporal transformer takes sites k..k+2d ◄───┘
//! ```
//!
//! Every closure returns a tensor with the shape it received.

mod attention;
mod film;
mod guidance;
mod text_encoder;

use candle_core::{DType, Result, Tensor, D};

use crate::models::ModelError;

pub use attention::AttentionTextConditioner;
pub use film::{film_modulate, TextConditioner};
pub use guidance::ClassifierFreeGuidance;
pub use text_encoder::{TextEncoder, TokenEmbeddingTextEncoder};

/// Per-site modulation closure.
pub type CondFn = Box<dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync>;

/// Instructions handed to a conditioner: exactly one of raw text or embeddings.
#[derive(Clone, Copy)]
pub enum TextInput<'a> {
    Texts(&'a [&'a str]),
    /// `(batch, num_tokens, text_embed_dim)`
    Embeds(&'a Tensor),
}

impl<'a> TextInput<'a> {
    /// Build from the two optional entry points, rejecting neither and both.
    pub fn from_options(
        texts: Option<&'a [&'a str]>,
        text_embeds: Option<&'a Tensor>,
    ) -> std::result::Result<Self, ModelError> {
        match (texts, text_embeds) {
            (Some(texts), None) => Ok(Self::Texts(texts)),
            (None, Some(embeds)) => Ok(Self::Embeds(embeds)),
            (None, None) => Err(ModelError::MissingCondition),
            (Some(_), Some(_)) => Err(ModelError::ConflictingCondition),
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        match self {
            Self::Texts(texts) => Ok(texts.len()),
            Self::Embeds(embeds) => embeds.dim(0),
        }
    }
}

impl std::fmt::Debug for TextInput<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Texts(texts) => f.debug_tuple("Texts").field(texts).finish(),
            Self::Embeds(embeds) => f.debug_tuple("Embeds").field(&embeds.dims()).finish(),
        }
    }
}

/// Produces per-site modulation closures from instructions.
pub trait Conditioner: Send + Sync {
    /// Number of conditioning sites this conditioner was sized for.
    fn num_sites(&self) -> usize;

    /// Width of the text embeddings it consumes.
    fn text_embed_dim(&self) -> usize;

    /// Encode raw instructions into `(batch, tokens, text_embed_dim)`.
    fn embed_texts(&self, texts: &[&str]) -> Result<Tensor>;

    /// Attach the encoder used for raw-text instructions.
    fn set_text_encoder(&mut self, encoder: Box<dyn TextEncoder>) -> Result<()>;

    /// Build one closure per site.
    ///
    /// `repeat_batch[i]` repeats the condition of every batch item that many
    /// times (batch-major) for site `i`, so that sites operating on a
    /// `(batch * frames)` image batch see one condition per image.
    fn condition(
        &self,
        input: TextInput<'_>,
        cond_drop_prob: f64,
        repeat_batch: &[usize],
    ) -> Result<CondFns>;
}

/// Indexed sequence of modulation closures for one forward call.
pub struct CondFns {
    fns: Vec<CondFn>,
}

impl CondFns {
    pub fn new(fns: Vec<CondFn>) -> Self {
        Self { fns }
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CondFn> {
        self.fns.get(index)
    }

    /// Cursor over all sites.
    pub fn cursor(&self) -> CondCursor<'_> {
        CondCursor::new(&self.fns)
    }

    /// Split into a cursor over the first `mid` sites and one over the rest.
    pub fn split_at(&self, mid: usize) -> Result<(CondCursor<'_>, CondCursor<'_>)> {
        if mid > self.fns.len() {
            candle_core::bail!(
                "cannot split {} conditioning sites at {mid}",
                self.fns.len()
            );
        }
        let (head, tail) = self.fns.split_at(mid);
        Ok((CondCursor::new(head), CondCursor::new(tail)))
    }
}

impl std::fmt::Debug for CondFns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondFns").field("len", &self.fns.len()).finish()
    }
}

/// Monotonic cursor over a slice of closures.
pub struct CondCursor<'a> {
    fns: &'a [CondFn],
    pos: usize,
}

impl<'a> CondCursor<'a> {
    pub fn new(fns: &'a [CondFn]) -> Self {
        Self { fns, pos: 0 }
    }

    /// Take the next closure; running past the end is an error.
    pub fn next_fn(&mut self) -> Result<&'a CondFn> {
        let Some(cond_fn) = self.fns.get(self.pos) else {
            candle_core::bail!(
                "conditioning sequence exhausted: requested site {} of {}",
                self.pos,
                self.fns.len()
            );
        };
        self.pos += 1;
        Ok(cond_fn)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.fns.len() - self.pos
    }
}

/// Take the next closure when a cursor is present.
pub(crate) fn next_cond_fn<'a>(
    cursor: &mut Option<&mut CondCursor<'a>>,
) -> Result<Option<&'a CondFn>> {
    match cursor {
        Some(cursor) => cursor.next_fn().map(Some),
        None => Ok(None),
    }
}

/// Validity mask of precomputed embeddings: a token counts when any feature is non-zero.
///
/// Returns `(batch, tokens)` in `U8`.
pub fn embeds_mask(embeds: &Tensor) -> Result<Tensor> {
    embeds.abs()?.max(D::Minus1)?.gt(0.0)
}

/// Mean over valid tokens: `(b, n, d)`, `(b, n)` → `(b, d)`.
///
/// Items without any valid token pool to zero.
pub fn masked_mean(embeds: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(embeds.dtype())?;
    let summed = embeds.broadcast_mul(&mask.unsqueeze(D::Minus1)?)?.sum(1)?;
    let counts = mask.sum_keepdim(1)?.maximum(1.0)?;
    summed.broadcast_div(&counts)
}

/// Per-item keep mask `(batch,)` in `U8`, dropping each item with probability `cond_drop_prob`.
pub fn keep_mask(
    batch: usize,
    cond_drop_prob: f64,
    device: &candle_core::Device,
) -> Result<Tensor> {
    if cond_drop_prob <= 0.0 {
        Tensor::ones(batch, DType::U8, device)
    } else if cond_drop_prob >= 1.0 {
        Tensor::zeros(batch, DType::U8, device)
    } else {
        Tensor::rand(0f32, 1f32, batch, device)?.ge(cond_drop_prob)
    }
}

/// Repeat every batch item `repeats` times, batch-major: `(b, ..) -> (b * repeats, ..)`.
pub fn repeat_batch_major(xs: &Tensor, repeats: usize) -> Result<Tensor> {
    if repeats == 1 {
        return Ok(xs.clone());
    }
    let mut dims = xs.dims().to_vec();
    let b = dims[0];
    let mut expanded = vec![b, repeats];
    expanded.extend_from_slice(&dims[1..]);
    dims[0] = b * repeats;
    xs.unsqueeze(1)?
        .broadcast_as(expanded)?
        .contiguous()?
        .reshape(dims)
}

/// Resolve instructions into `(embeds, mask)` with the given encoder.
pub(crate) fn resolve_text(
    input: TextInput<'_>,
    encoder: Option<&dyn TextEncoder>,
    text_embed_dim: usize,
) -> Result<(Tensor, Tensor)> {
    let (embeds, mask) = match input {
        TextInput::Embeds(embeds) => (embeds.clone(), embeds_mask(embeds)?),
        TextInput::Texts(texts) => {
            let Some(encoder) = encoder else {
                candle_core::bail!(
                    "raw instructions need a text encoder; pass text embeddings instead"
                );
            };
            encoder.encode(texts)?
        }
    };
    let (_, _, dim) = embeds.dims3()?;
    if dim != text_embed_dim {
        candle_core::bail!(
            "text embeddings have width {dim}, conditioner expects {text_embed_dim}"
        );
    }
    Ok((embeds, mask))
}
