//! Structured logging setup.
//!
//! Supports two modes:
//! - Development: Pretty-printed human-readable logs
//! - Production: JSON-formatted logs for log aggregation
//!
//! Set `TENSOR_LORA_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("TENSOR_LORA_LOG_FORMAT").unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize logging from `RUST_LOG` and `TENSOR_LORA_LOG_FORMAT`.
pub fn init() {
    init_with_level_and_format(None, LogFormat::from_env());
}

/// Initialize logging with a fallback level for when `RUST_LOG` is unset.
pub fn init_with_level(level: &str) {
    init_with_level_and_format(Some(level), LogFormat::from_env());
}

/// Initialize logging with an explicit level and format.
///
/// A second call is a no-op, so tests may initialize freely.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
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
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}
