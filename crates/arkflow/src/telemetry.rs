//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigError;

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| ConfigError::Validation {
        message: format!("invalid logging.level '{}': {}", config.level, e),
    })
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// level. `log` records are forwarded to the subscriber.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, ConfigError> {
    let filter = env_filter(config)?;

    let installed = match config.format {
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).try_init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).try_init(),
    };

    if installed.is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_invalid_level_is_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "arkflow=verbose".to_string(),
            format: LogFormat::Text,
        };
        assert!(matches!(
            init_tracing(&config),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_second_init_is_tolerated() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Json,
        };
        let _ = init_tracing(&config).unwrap();
        assert!(!init_tracing(&config).unwrap());
    }
}
