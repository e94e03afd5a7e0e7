//! Tracing subscriber initialization.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "gradebook_engine=info,warn";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: match std::env::var("GRADEBOOK_LOG_FORMAT").as_deref() {
                Ok("pretty") => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Failed to init subscriber: {0}")]
    Init(String),
}

/// Install the global tracing subscriber.
///
/// Call once at start-up. A second call fails because a global subscriber
/// is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::info!(format = ?config.format, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig {
            format: LogFormat::Pretty,
            default_filter: DEFAULT_FILTER.to_string(),
        };
        // Another test may have installed a subscriber first; either way the
        // last of two calls must fail.
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(TelemetryError::Init(_))));
    }

    #[test]
    fn test_default_filter() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_filter, DEFAULT_FILTER);
    }
}
