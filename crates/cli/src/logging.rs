//! Logging setup for the `hlt` binary.
//!
//! Two output modes:
//! - Pretty: human-readable lines (default)
//! - Json: one JSON object per event, for log collectors
//!
//! Set `HLT_LOG_FORMAT=json` to switch to JSON.
//! `RUST_LOG` takes precedence over any level passed in code.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const FORMAT_ENV: &str = "HLT_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Detect log format from `HLT_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(FORMAT_ENV).unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize logging with the format from the environment and level `info`.
pub fn init() {
    init_with_level_and_format(None, LogFormat::from_env());
}

/// Initialize logging with an explicit level (`"debug"`, `"warn"`, ...).
pub fn init_with_level(level: &str) {
    init_with_level_and_format(Some(level), LogFormat::from_env());
}

pub fn init_with_format(format: LogFormat) {
    init_with_level_and_format(None, format);
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "logging already initialized");
    }
}
