use crate::config::{
    ConditionerKind, HlTransformerConfig, HltConfig, MaxVitConfig, TextConditionerConfig,
};

/// Two-stage MaxViT (widths 8 and 16, window 2); frames must be multiples of 16px.
pub fn tiny_max_vit_config() -> MaxVitConfig {
    MaxVitConfig {
        num_classes: 5,
        dim: 8,
        depth: vec![1, 2],
        dim_head: 4,
        dim_conv_stem: Some(4),
        window_size: 2,
        mbconv_expansion_rate: 2.0,
        mbconv_shrinkage_rate: 0.25,
        mbconv_dropsample: 0.0,
        num_mem_kv: 2,
        dropout: 0.0,
        channels: 3,
    }
}

/// Two-layer temporal transformer over 2 learned tokens per frame, 16-wide text.
pub fn tiny_hl_transformer_config() -> HlTransformerConfig {
    HlTransformerConfig {
        num_actions: 4,
        action_bins: 8,
        depth: 2,
        heads: 2,
        dim_head: 8,
        token_learner_ff_mult: 2,
        token_learner_num_output_tokens: 2,
        cond_drop_prob: 0.2,
        attn_dropout: 0.0,
        ff_dropout: 0.0,
        conditioner_kind: ConditionerKind::Film,
        conditioner: TextConditionerConfig {
            text_embed_dim: 16,
            film_hidden_mult: 2,
            attn_heads: 2,
            attn_dim_head: 8,
        },
    }
}

/// Flat HLT config with the same backbone scale as [`tiny_max_vit_config`].
pub fn tiny_hlt_config() -> HltConfig {
    HltConfig {
        num_classes: 5,
        dim_conv_stem: 4,
        dim: 8,
        dim_head: 4,
        depth: vec![1, 1],
        window_size: 2,
        mbconv_expansion_rate: 2.0,
        mbconv_shrinkage_rate: 0.25,
        dropout: 0.0,
        num_actions: 3,
        action_bins: 4,
        hl_depth: 1,
        hl_heads: 2,
        hl_dim_head: 4,
        cond_drop_prob: 0.2,
        text_embed_dim: 8,
    }
}
