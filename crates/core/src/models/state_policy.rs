use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::FeedForward;

/// Maps a state vector to a same-width policy feature through a feed-forward block.
#[derive(Clone, Debug)]
pub struct StatePolicy {
    ffn: FeedForward,
}

impl StatePolicy {
    pub const DEFAULT_DIM: usize = 512;
    pub const DEFAULT_MULT: f64 = 2.0;
    pub const DEFAULT_DROPOUT: f64 = 0.1;

    pub fn new(dim: usize, mult: f64, dropout: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ffn: FeedForward::new(dim, mult, dropout, vb.pp("ffn"))?,
        })
    }

    /// Built with the default width, multiplier and dropout.
    pub fn with_defaults(vb: VarBuilder) -> Result<Self> {
        Self::new(
            Self::DEFAULT_DIM,
            Self::DEFAULT_MULT,
            Self::DEFAULT_DROPOUT,
            vb,
        )
    }

    pub fn dim(&self) -> usize {
        self.ffn.dim()
    }

    pub fn forward(&self, state: &Tensor, train: bool) -> Result<Tensor> {
        self.ffn.forward(state, None, train)
    }
}
