use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

use crate::layers::{layer_norm, LayerNorm};
use crate::tokenizer::TokenizerWrapper;

/// Turns raw instructions into token embeddings.
///
/// Pretrained encoders plug in here; the model only sees the output tensors.
pub trait TextEncoder: Send + Sync {
    /// Width of the produced embeddings.
    fn dim(&self) -> usize;

    /// Encode a batch of instructions.
    ///
    /// Returns `(embeds, mask)`: `(batch, max_tokens, dim)` zero-padded to the
    /// longest instruction, and the `(batch, max_tokens)` `U8` validity mask.
    fn encode(&self, texts: &[&str]) -> Result<(Tensor, Tensor)>;
}

/// Word-level tokenizer followed by a learned embedding table and LayerNorm.
pub struct TokenEmbeddingTextEncoder {
    tokenizer: TokenizerWrapper,
    embedding: Embedding,
    norm: LayerNorm,
    dim: usize,
    device: Device,
}

impl TokenEmbeddingTextEncoder {
    pub fn new(tokenizer: TokenizerWrapper, dim: usize, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let embedding = embedding(tokenizer.vocab_size(), dim, vb.pp("token_emb"))?;
        let norm = layer_norm(dim, vb.pp("norm"))?;
        Ok(Self {
            tokenizer,
            embedding,
            norm,
            dim,
            device,
        })
    }

    fn tokenize(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|text| {
                self.tokenizer
                    .encode(text)
                    .map_err(|e| candle_core::Error::Msg(format!("tokenize {text:?}: {e}")))
            })
            .collect()
    }
}

impl TextEncoder for TokenEmbeddingTextEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn encode(&self, texts: &[&str]) -> Result<(Tensor, Tensor)> {
        if texts.is_empty() {
            candle_core::bail!("cannot encode an empty batch of instructions");
        }
        let token_ids = self.tokenize(texts)?;
        // at least one slot so an empty instruction still yields a (pad) token
        let max_len = token_ids.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut ids = Vec::with_capacity(texts.len() * max_len);
        let mut valid = Vec::with_capacity(texts.len() * max_len);
        for row in &token_ids {
            ids.extend_from_slice(row);
            ids.extend(std::iter::repeat(0u32).take(max_len - row.len()));
            valid.extend(std::iter::repeat(1u8).take(row.len()));
            valid.extend(std::iter::repeat(0u8).take(max_len - row.len()));
        }
        let ids = Tensor::from_vec(ids, (texts.len(), max_len), &self.device)?;
        let mask = Tensor::from_vec(valid, (texts.len(), max_len), &self.device)?;

        let embeds = self.norm.forward(&self.embedding.forward(&ids)?)?;
        let embeds = embeds.broadcast_mul(&mask.to_dtype(embeds.dtype())?.unsqueeze(2)?)?;
        tracing::debug!(batch = texts.len(), max_len, "encoded instructions");
        Ok((embeds, mask))
    }
}

impl std::fmt::Debug for TokenEmbeddingTextEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbeddingTextEncoder")
            .field("vocab_size", &self.tokenizer.vocab_size())
            .field("dim", &self.dim)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn encoder(dim: usize) -> TokenEmbeddingTextEncoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let tokenizer =
            TokenizerWrapper::from_vocab(&["pick", "up", "the", "red", "cup", "go"]).unwrap();
        TokenEmbeddingTextEncoder::new(tokenizer, dim, vb).unwrap()
    }

    #[test]
    fn pads_to_longest_instruction() {
        let enc = encoder(8);
        assert_eq!(enc.dim(), 8);
        let (embeds, mask) = enc.encode(&["pick up the red cup", "go"]).unwrap();
        assert_eq!(embeds.dims(), &[2, 5, 8]);
        assert_eq!(
            mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 1, 1, 1], vec![1, 0, 0, 0, 0]]
        );

        // padded positions are exactly zero
        let pad = embeds.narrow(0, 1, 1).unwrap().narrow(1, 1, 4).unwrap();
        let max = pad.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn empty_instruction_gets_one_masked_slot() {
        let enc = encoder(4);
        let (embeds, mask) = enc.encode(&[""]).unwrap();
        assert_eq!(embeds.dims(), &[1, 1, 4]);
        assert_eq!(mask.to_vec2::<u8>().unwrap(), vec![vec![0]]);
    }

    #[test]
    fn empty_batch_is_error() {
        let enc = encoder(4);
        assert!(enc.encode(&[]).is_err());
    }
}
