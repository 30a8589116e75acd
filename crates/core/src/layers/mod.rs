pub mod attention;
pub mod drop;
pub mod mask;
pub mod mlp;
pub mod normalization;
pub mod posemb;
pub mod window_attention;

pub use attention::{repeat_kv, AttentionInputs, TransformerAttention};
pub use drop::Dropsample;
pub use mask::{causal_mask, frame_causal_mask, masked_fill};
pub use mlp::FeedForward;
pub use normalization::{layer_norm, LayerNorm};
pub use posemb::posemb_sincos_1d;
pub use window_attention::{relative_position_indices, WindowAttention};
