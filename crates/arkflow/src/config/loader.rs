//! Loading and validating the JSON configuration file.
//!
//! A document is checked against the embedded schema before it is
//! deserialized, then against the rules the schema cannot express.

use std::path::Path;

use crate::config::schema::{Config, RouteConfig, WorkerEndpoint};
use crate::error::ConfigError;
use crate::task::ProcessingType;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");
const SUPPORTED_VERSION: &str = "1.0";

/// Reads and validates the config file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(raw) => load_config_from_str(&raw),
        Err(source) => Err(ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let document: serde_json::Value = serde_json::from_str(content)?;
    check_schema(&document)?;
    let config = serde_json::from_value::<Config>(document)?;
    validate_config(&config)?;
    Ok(config)
}

fn check_schema(document: &serde_json::Value) -> Result<(), ConfigError> {
    let embedded = |stage: &str, e: &dyn std::fmt::Display| ConfigError::Validation {
        message: format!("embedded config schema {}: {}", stage, e),
    };
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| embedded("is not JSON", &e))?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| embedded("does not compile", &e))?;

    let violations: Vec<String> = validator
        .iter_errors(document)
        .map(|e| e.to_string())
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::SchemaValidation {
            errors: violations.join("; "),
        })
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != SUPPORTED_VERSION {
        return Err(ConfigError::Validation {
            message: format!(
                "unsupported config version '{}', expected '{}'",
                config.version, SUPPORTED_VERSION
            ),
        });
    }

    let polling = &config.polling;
    if polling.interval_ms == 0 {
        return Err(invalid("polling.interval_ms must be greater than 0"));
    }
    if polling.deadline() < polling.interval() {
        return Err(invalid("polling.deadline_secs must not be shorter than the poll interval"));
    }
    if polling.call_timeout_secs == 0 || polling.submit_timeout_secs == 0 {
        return Err(invalid("polling timeouts must be greater than 0"));
    }

    if config.chunking.max_chars == 0 {
        return Err(invalid("chunking.max_chars must be greater than 0"));
    }
    if config.queue.consumer_concurrency == 0 {
        return Err(invalid("queue.consumer_concurrency must be greater than 0"));
    }
    if config.queue.callback_timeout() <= config.chunking.ingest_timeout() {
        return Err(invalid(
            "queue.callback_timeout_secs must be longer than chunking.ingest_timeout_secs",
        ));
    }
    if config.reaper.enabled && config.reaper.stale_after() < polling.deadline() {
        return Err(invalid(
            "reaper.stale_after_secs must not be shorter than polling.deadline_secs",
        ));
    }

    for processing_type in ProcessingType::ALL {
        if let RouteConfig::Queue { topic } = config.dispatch.routes.route_for(processing_type) {
            if topic.trim().is_empty() {
                return Err(ConfigError::Validation {
                    message: format!("Queue route for {} needs a topic", processing_type),
                });
            }
        }
    }

    for (name, endpoint) in config.workers.endpoints() {
        validate_endpoint(name, endpoint)?;
    }

    Ok(())
}

fn validate_endpoint(name: &str, endpoint: &WorkerEndpoint) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(&endpoint.base_url).map_err(|e| ConfigError::InvalidEndpoint {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidEndpoint {
            name: name.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if endpoint.timeout_secs == 0 {
        return Err(ConfigError::InvalidEndpoint {
            name: name.to_string(),
            reason: "timeout_secs must be greater than 0".to_string(),
        });
    }
    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}
