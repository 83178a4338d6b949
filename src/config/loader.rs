//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment
//! variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use super::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed, or if
/// validation fails.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        endpoint = %config.server.endpoint,
        subnet = %config.server.subnet,
        "configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `AWG_CONTROL_ENDPOINT`: Override the public endpoint
/// - `AWG_CONTROL_LOG_LEVEL`: Override log level
/// - `AWG_CONTROL_SUBNET`: Override the tunnel subnet
/// - `AWG_CONTROL_CONFIG_DIR`: Override the shared config directory
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(endpoint) = std::env::var("AWG_CONTROL_ENDPOINT") {
        config.server.endpoint = endpoint;
        debug!("endpoint overridden to {}", config.server.endpoint);
    }

    if let Ok(level) = std::env::var("AWG_CONTROL_LOG_LEVEL") {
        config.log.level = level;
        debug!("log level overridden to {}", config.log.level);
    }

    if let Ok(subnet) = std::env::var("AWG_CONTROL_SUBNET") {
        config.server.subnet = subnet.parse().map_err(|_| ConfigError::EnvError {
            name: "AWG_CONTROL_SUBNET".into(),
            reason: format!("invalid subnet: {subnet}"),
        })?;
        debug!("subnet overridden to {}", config.server.subnet);
    }

    if let Ok(dir) = std::env::var("AWG_CONTROL_CONFIG_DIR") {
        config.server.config_dir = dir.into();
        debug!("config directory overridden to {:?}", config.server.config_dir);
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
