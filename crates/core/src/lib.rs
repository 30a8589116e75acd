//! HLT: a MaxViT backbone, a token learner and a block-causal temporal
//! transformer that map text-conditioned video to per-frame action-bin logits.

pub mod conditioning;
pub mod config;
pub mod layers;
pub mod models;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
