//! Shared test utilities for hlt-core.
//!
//! Tiny configurations that build in milliseconds on CPU, a deterministic
//! text encoder and a VarMap-backed builder for numeric tests.

mod mock_text_encoder;
mod tiny_config;

pub use mock_text_encoder::MockTextEncoder;
pub use tiny_config::{tiny_hl_transformer_config, tiny_hlt_config, tiny_max_vit_config};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

/// Randomly initialized F32 weights; keep the `VarMap` to inspect or overwrite them.
pub fn varmap_builder(device: &Device) -> (VarMap, VarBuilder<'static>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    (varmap, vb)
}
