use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("exactly one of texts or text_embeds must be supplied, got neither")]
    MissingCondition,

    #[error("exactly one of texts or text_embeds must be supplied, got both")]
    ConflictingCondition,

    #[error("video batch is {video} but {texts} instructions were given")]
    BatchMismatch { video: usize, texts: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
