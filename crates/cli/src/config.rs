//! Configuration persistence for the `hlt` runner.
//!
//! Settings are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/hlt/config.toml, or `--config <path>`)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_FRAMES: usize = 6;
pub const DEFAULT_IMAGE_SIZE: usize = 112;
pub const DEFAULT_BATCH: usize = 1;
pub const DEFAULT_COND_SCALE: f64 = 1.0;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_DTYPE: &str = "f32";

/// Persistent runner configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// JSON file holding an `HltConfig`. The built-in small model when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_config: Option<String>,

    /// `tokenizer.json` for raw instructions. A vocabulary is built from the
    /// instruction words when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,

    /// Frames per video.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,

    /// Videos per batch when no instructions are given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,

    /// Classifier-free guidance scale; 1.0 runs a single conditioned pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond_scale: Option<f64>,

    /// Weight data type (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Fully resolved settings for one `hlt run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub model_config: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub frames: usize,
    pub height: usize,
    pub width: usize,
    pub batch: usize,
    pub cond_scale: f64,
    pub dtype: String,
    pub log_level: String,
}

impl CliConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hlt").join("config.toml"))
    }

    /// Load configuration from the default path; missing or broken files yield defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = self.to_toml()?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.model_config.is_some() {
            self.model_config = other.model_config.clone();
        }
        if other.tokenizer.is_some() {
            self.tokenizer = other.tokenizer.clone();
        }
        if other.frames.is_some() {
            self.frames = other.frames;
        }
        if other.height.is_some() {
            self.height = other.height;
        }
        if other.width.is_some() {
            self.width = other.width;
        }
        if other.batch.is_some() {
            self.batch = other.batch;
        }
        if other.cond_scale.is_some() {
            self.cond_scale = other.cond_scale;
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }

    /// Fill unset fields with defaults.
    pub fn resolve(&self) -> RunSettings {
        RunSettings {
            model_config: self.model_config.as_ref().map(PathBuf::from),
            tokenizer: self.tokenizer.as_ref().map(PathBuf::from),
            frames: self.frames.unwrap_or(DEFAULT_FRAMES),
            height: self.height.unwrap_or(DEFAULT_IMAGE_SIZE),
            width: self.width.unwrap_or(DEFAULT_IMAGE_SIZE),
            batch: self.batch.unwrap_or(DEFAULT_BATCH),
            cond_scale: self.cond_scale.unwrap_or(DEFAULT_COND_SCALE),
            dtype: self
                .dtype
                .clone()
                .unwrap_or_else(|| DEFAULT_DTYPE.to_string()),
            log_level: self
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
