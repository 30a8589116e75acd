//! Configuration records for the MaxViT backbone, the HLTransformer and the
//! flat HLT wrapper.
//!
//! All records deserialize from JSON with per-field defaults, so a config file
//! only needs the fields that differ from the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors raised by `validate()` and the loaders.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("depth needs at least one stage")]
    EmptyDepth,

    #[error("dimension {dim} should be divisible by dimension per head {dim_head}")]
    HeadDimMismatch { dim: usize, dim_head: usize },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} must lie in [0, 1], got {value}")]
    Probability { name: &'static str, value: f64 },

    #[error("{name} must lie in [0, 1), got {value}")]
    DropoutRate { name: &'static str, value: f64 },

    #[error("{name} must be positive, got {value}")]
    NonPositiveRate { name: &'static str, value: f64 },

    #[error("squeeze-excitation width int({dim} * {rate}) is zero")]
    EmptySqueeze { dim: usize, rate: f64 },

    #[error("spatial size {height}x{width} must be divisible by {multiple}")]
    SpatialSize {
        height: usize,
        width: usize,
        multiple: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn check_probability(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Probability { name, value })
    }
}

/// Dropout-style rates; a rate of 1 would zero every activation.
fn check_dropout(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::DropoutRate { name, value })
    }
}

fn check_positive(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero(name))
    } else {
        Ok(())
    }
}

// ─── MaxViT ──────────────────────────────────────────────────────────────────

/// Hyperparameters of the MaxViT backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxVitConfig {
    /// Classes of the optional classification head.
    pub num_classes: usize,
    /// Width of the first stage; stage `i` is `dim * 2^i` wide.
    pub dim: usize,
    /// Number of blocks in every stage.
    pub depth: Vec<usize>,
    /// Per-head width of the windowed attention.
    pub dim_head: usize,
    /// Stem width, defaults to `dim`.
    pub dim_conv_stem: Option<usize>,
    /// Side of the square attention window.
    pub window_size: usize,
    /// MBConv hidden width multiplier over its output width.
    pub mbconv_expansion_rate: f64,
    /// Squeeze-excitation bottleneck multiplier (raw multiplier, `2` and `0.25` are both valid).
    pub mbconv_shrinkage_rate: f64,
    /// Drop-sample probability of residual MBConv branches.
    pub mbconv_dropsample: f64,
    /// Learned memory key/value slots per windowed attention.
    pub num_mem_kv: usize,
    /// Dropout of attention and feed-forward blocks.
    pub dropout: f64,
    /// Input image channels.
    pub channels: usize,
}

impl Default for MaxVitConfig {
    fn default() -> Self {
        // MaxViT-T style backbone at 224px
        Self {
            num_classes: 1000,
            dim: 96,
            depth: vec![2, 2, 5, 2],
            dim_head: 32,
            dim_conv_stem: Some(64),
            window_size: 7,
            mbconv_expansion_rate: 4.0,
            mbconv_shrinkage_rate: 0.25,
            mbconv_dropsample: 0.0,
            num_mem_kv: 4,
            dropout: 0.1,
            channels: 3,
        }
    }
}

impl MaxVitConfig {
    /// MaxViT-T layout for 224px frames.
    pub fn max_vit_tiny_224() -> Self {
        Self::default()
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn stem_dim(&self) -> usize {
        self.dim_conv_stem.unwrap_or(self.dim)
    }

    pub fn num_stages(&self) -> usize {
        self.depth.len()
    }

    /// Output width of every stage.
    pub fn stage_dims(&self) -> Vec<usize> {
        (0..self.num_stages()).map(|i| self.dim << i).collect()
    }

    /// Width of the final spatial embedding map.
    pub fn embed_dim(&self) -> usize {
        self.stage_dims().last().copied().unwrap_or(self.stem_dim())
    }

    /// Input width of every stage-block, in execution order.
    pub fn cond_hidden_dims(&self) -> Vec<usize> {
        let mut dims_in = vec![self.stem_dim()];
        dims_in.extend(self.stage_dims());

        let mut out = Vec::with_capacity(self.depth.iter().sum());
        for (stage, &blocks) in self.depth.iter().enumerate() {
            for block in 0..blocks {
                out.push(if block == 0 {
                    dims_in[stage]
                } else {
                    dims_in[stage + 1]
                });
            }
        }
        out
    }

    /// Total spatial reduction of the backbone (stem plus one per stage).
    pub fn downsample_factor(&self) -> usize {
        1 << (self.num_stages() + 1)
    }

    /// Height and width must be multiples of this value.
    pub fn spatial_multiple(&self) -> usize {
        self.downsample_factor() * self.window_size
    }

    /// Check a frame size against the windowing constraints.
    pub fn check_spatial(&self, height: usize, width: usize) -> Result<(), ConfigError> {
        let multiple = self.spatial_multiple();
        if height == 0 || width == 0 || height % multiple != 0 || width % multiple != 0 {
            return Err(ConfigError::SpatialSize {
                height,
                width,
                multiple,
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth.is_empty() {
            return Err(ConfigError::EmptyDepth);
        }
        check_positive("dim", self.dim)?;
        check_positive("dim_head", self.dim_head)?;
        check_positive("window_size", self.window_size)?;
        check_positive("channels", self.channels)?;
        check_positive("num_classes", self.num_classes)?;
        check_positive("dim_conv_stem", self.stem_dim())?;
        if self.depth.iter().any(|&d| d == 0) {
            return Err(ConfigError::Zero("stage depth"));
        }
        for dim in self.stage_dims() {
            if dim % self.dim_head != 0 {
                return Err(ConfigError::HeadDimMismatch {
                    dim,
                    dim_head: self.dim_head,
                });
            }
        }
        if self.mbconv_expansion_rate <= 0.0 {
            return Err(ConfigError::NonPositiveRate {
                name: "mbconv_expansion_rate",
                value: self.mbconv_expansion_rate,
            });
        }
        if self.mbconv_shrinkage_rate <= 0.0 {
            return Err(ConfigError::NonPositiveRate {
                name: "mbconv_shrinkage_rate",
                value: self.mbconv_shrinkage_rate,
            });
        }
        for dim in self.stage_dims() {
            let hidden = (self.mbconv_expansion_rate * dim as f64) as usize;
            if (hidden as f64 * self.mbconv_shrinkage_rate) as usize == 0 {
                return Err(ConfigError::EmptySqueeze {
                    dim: hidden,
                    rate: self.mbconv_shrinkage_rate,
                });
            }
        }
        check_dropout("mbconv_dropsample", self.mbconv_dropsample)?;
        check_dropout("dropout", self.dropout)?;
        Ok(())
    }
}

// ─── Text conditioner ────────────────────────────────────────────────────────

/// Conditioner flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionerKind {
    /// Feature-wise scale/shift from pooled text embeddings.
    #[default]
    Film,
    /// Cross-attention from hiddens to text tokens.
    Attention,
}

/// Hyperparameters of the text conditioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConditionerConfig {
    /// Width of the instruction embeddings.
    pub text_embed_dim: usize,
    /// Hidden multiplier of the FiLM heads.
    pub film_hidden_mult: usize,
    /// Heads of the attention conditioner.
    pub attn_heads: usize,
    /// Per-head width of the attention conditioner.
    pub attn_dim_head: usize,
}

impl Default for TextConditionerConfig {
    fn default() -> Self {
        Self {
            text_embed_dim: 512,
            film_hidden_mult: 4,
            attn_heads: 4,
            attn_dim_head: 32,
        }
    }
}

impl TextConditionerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("text_embed_dim", self.text_embed_dim)?;
        check_positive("film_hidden_mult", self.film_hidden_mult)?;
        check_positive("attn_heads", self.attn_heads)?;
        check_positive("attn_dim_head", self.attn_dim_head)
    }
}

// ─── HLTransformer ───────────────────────────────────────────────────────────

/// Hyperparameters of the temporal transformer and action head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HlTransformerConfig {
    /// Number of action dimensions.
    pub num_actions: usize,
    /// Discretization buckets per action dimension.
    pub action_bins: usize,
    /// Temporal transformer layers.
    pub depth: usize,
    /// Query heads of the temporal attention.
    pub heads: usize,
    /// Per-head width of the temporal attention.
    pub dim_head: usize,
    /// Hidden multiplier of the token learner MLP.
    pub token_learner_ff_mult: usize,
    /// Learned tokens per frame.
    pub token_learner_num_output_tokens: usize,
    /// Probability of dropping the text condition during training.
    pub cond_drop_prob: f64,
    /// Attention dropout of the temporal transformer.
    pub attn_dropout: f64,
    /// Feed-forward dropout of the temporal transformer.
    pub ff_dropout: f64,
    /// Which conditioner drives the modulation sites.
    pub conditioner_kind: ConditionerKind,
    pub conditioner: TextConditionerConfig,
}

impl Default for HlTransformerConfig {
    fn default() -> Self {
        Self {
            num_actions: 11,
            action_bins: 256,
            depth: 4,
            heads: 8,
            dim_head: 64,
            token_learner_ff_mult: 2,
            token_learner_num_output_tokens: 8,
            cond_drop_prob: 0.2,
            attn_dropout: 0.0,
            ff_dropout: 0.0,
            conditioner_kind: ConditionerKind::Film,
            conditioner: TextConditionerConfig::default(),
        }
    }
}

impl HlTransformerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("num_actions", self.num_actions)?;
        check_positive("action_bins", self.action_bins)?;
        check_positive("heads", self.heads)?;
        check_positive("dim_head", self.dim_head)?;
        check_positive("token_learner_ff_mult", self.token_learner_ff_mult)?;
        check_positive(
            "token_learner_num_output_tokens",
            self.token_learner_num_output_tokens,
        )?;
        check_probability("cond_drop_prob", self.cond_drop_prob)?;
        check_dropout("attn_dropout", self.attn_dropout)?;
        check_dropout("ff_dropout", self.ff_dropout)?;
        self.conditioner.validate()
    }

    /// Conditioning sites consumed by the temporal transformer.
    pub fn num_transformer_cond_sites(&self) -> usize {
        self.depth * 2
    }
}

// ─── HLT (flat) ──────────────────────────────────────────────────────────────

/// Flat configuration of the full HLT model (backbone + temporal transformer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HltConfig {
    pub num_classes: usize,
    pub dim_conv_stem: usize,
    pub dim: usize,
    pub dim_head: usize,
    pub depth: Vec<usize>,
    pub window_size: usize,
    pub mbconv_expansion_rate: f64,
    pub mbconv_shrinkage_rate: f64,
    pub dropout: f64,
    pub num_actions: usize,
    pub action_bins: usize,
    pub hl_depth: usize,
    pub hl_heads: usize,
    pub hl_dim_head: usize,
    pub cond_drop_prob: f64,
    pub text_embed_dim: usize,
}

impl Default for HltConfig {
    fn default() -> Self {
        Self {
            num_classes: 1000,
            dim_conv_stem: 64,
            dim: 96,
            dim_head: 32,
            depth: vec![4, 4, 4],
            window_size: 7,
            mbconv_expansion_rate: 4.0,
            mbconv_shrinkage_rate: 2.0,
            dropout: 0.1,
            num_actions: 11,
            action_bins: 256,
            hl_depth: 4,
            hl_heads: 8,
            hl_dim_head: 64,
            cond_drop_prob: 0.2,
            text_embed_dim: 512,
        }
    }
}

impl HltConfig {
    /// Three-stage model for 112px frames.
    pub fn hlt_small() -> Self {
        Self::default()
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn max_vit_config(&self) -> MaxVitConfig {
        MaxVitConfig {
            num_classes: self.num_classes,
            dim: self.dim,
            depth: self.depth.clone(),
            dim_head: self.dim_head,
            dim_conv_stem: Some(self.dim_conv_stem),
            window_size: self.window_size,
            mbconv_expansion_rate: self.mbconv_expansion_rate,
            mbconv_shrinkage_rate: self.mbconv_shrinkage_rate,
            dropout: self.dropout,
            ..MaxVitConfig::default()
        }
    }

    pub fn hl_transformer_config(&self) -> HlTransformerConfig {
        HlTransformerConfig {
            num_actions: self.num_actions,
            action_bins: self.action_bins,
            depth: self.hl_depth,
            heads: self.hl_heads,
            dim_head: self.hl_dim_head,
            cond_drop_prob: self.cond_drop_prob,
            conditioner: TextConditionerConfig {
                text_embed_dim: self.text_embed_dim,
                ..TextConditionerConfig::default()
            },
            ..HlTransformerConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.max_vit_config().validate()?;
        self.hl_transformer_config().validate()
    }
}
