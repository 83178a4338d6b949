//! Service configuration
//!
//! Configuration is a JSON file plus a small set of environment overrides.
//! Every knob an operator might reasonably change is here rather than
//! hard-coded: the tunnel subnet, the grace period, lease timings, reload
//! retries, and the logging surface.
//!
//! # Example
//!
//! ```no_run
//! use awg_control::config::load_config;
//!
//! let config = load_config("/etc/awg-control/config.json").unwrap();
//! println!("Tunnel subnet: {}", config.server.subnet);
//! ```

mod loader;
mod types;

use thiserror::Error;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    AllocatorSettings, Config, LockSettings, LogSettings, ServerSettings, SyncSettings,
};

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// The path that was tried
        path: String,
    },

    /// JSON parsing error
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable override error
    #[error("environment variable error: {name}: {reason}")]
    EnvError {
        /// The variable name
        name: String,
        /// Why the value was rejected
        reason: String,
    },

    /// I/O error while reading or writing config
    #[error("I/O error on configuration: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConfigError {
    /// Config errors are never recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}
