use candle_core::{DType, Device, Result, Tensor};

use crate::conditioning::TextEncoder;

/// Deterministic word-hash encoder: one pseudo-random vector per whitespace
/// word, zero-padded to the longest instruction.
#[derive(Debug, Clone)]
pub struct MockTextEncoder {
    dim: usize,
    device: Device,
}

impl MockTextEncoder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            device: Device::Cpu,
        }
    }

    fn word_vector(&self, word: &str) -> impl Iterator<Item = f32> {
        let seed = word
            .bytes()
            .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        (0..self.dim as u32).map(move |k| {
            let h = seed.wrapping_add(k.wrapping_mul(2_654_435_761)).rotate_left(7);
            // within (-1, 1), never exactly zero
            (h % 1000) as f32 / 500.0 - 0.999
        })
    }
}

impl TextEncoder for MockTextEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn encode(&self, texts: &[&str]) -> Result<(Tensor, Tensor)> {
        if texts.is_empty() {
            candle_core::bail!("cannot encode an empty batch of instructions");
        }
        let words: Vec<Vec<&str>> = texts
            .iter()
            .map(|t| t.split_whitespace().collect())
            .collect();
        let len = words.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut data = Vec::with_capacity(texts.len() * len * self.dim);
        let mut mask = Vec::with_capacity(texts.len() * len);
        for item in &words {
            for slot in 0..len {
                match item.get(slot) {
                    Some(word) => {
                        data.extend(self.word_vector(word));
                        mask.push(1u8);
                    }
                    None => {
                        data.resize(data.len() + self.dim, 0.0);
                        mask.push(0u8);
                    }
                }
            }
        }
        let embeds = Tensor::from_vec(data, (texts.len(), len, self.dim), &self.device)?;
        let mask = Tensor::from_vec(mask, (texts.len(), len), &self.device)?;
        Ok((embeds.to_dtype(DType::F32)?, mask))
    }
}
