//! Configuration types
//!
//! All structures are loaded from JSON and validated at startup; rendering
//! and the lifecycle manager receive already-validated values.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::keys::validate_key;
use crate::peers::manager::{LifecycleOptions, ServerContext};
use crate::peers::validation::validate_endpoint;
use crate::render::ObfuscationParams;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Gateway identity and daemon plumbing
    pub server: ServerSettings,

    /// Address pool behavior
    #[serde(default)]
    pub allocator: AllocatorSettings,

    /// Per-server lease timings
    #[serde(default)]
    pub lock: LockSettings,

    /// Commit and reload behavior
    #[serde(default)]
    pub sync: SyncSettings,

    /// Logging configuration
    #[serde(default)]
    pub log: LogSettings,
}

/// Gateway identity and daemon plumbing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    /// Identity used as the lease key and in log fields
    #[serde(default = "default_server_id")]
    pub id: String,

    /// Public `host:port` clients dial
    pub endpoint: String,

    /// UDP port the daemon listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Tunnel subnet peers are allocated from
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Net,

    /// The gateway's own tunnel address; defaults to the subnet's first host
    #[serde(default)]
    pub gateway_address: Option<Ipv4Addr>,

    /// Gateway private key, Base64; generated at startup when absent
    #[serde(default)]
    pub private_key: Option<String>,

    /// Base64 32-byte master key for sealing peer private keys at rest;
    /// retention is disabled when absent
    #[serde(default)]
    pub master_secret: Option<String>,

    /// Name of the daemon's container
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Daemon interface name
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// Shared directory holding the active config and its backup
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// DNS servers pushed to clients
    #[serde(default = "default_dns")]
    pub dns: [Ipv4Addr; 2],

    /// Obfuscation parameters; omit for plain WireGuard framing
    #[serde(default)]
    pub obfuscation: Option<ObfuscationParams>,
}

/// Address pool behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocatorSettings {
    /// Seconds a released address stays held before reuse
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Seconds between grace-period sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Per-server lease timings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockSettings {
    /// Lease TTL in seconds; bounds how long a crashed holder can block
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds a mutation waits for the lease before timing out
    #[serde(default = "default_lock_wait_secs")]
    pub wait_secs: u64,
}

/// Commit and reload behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncSettings {
    /// Extra reload attempts after the first failure
    #[serde(default = "default_reload_retries")]
    pub reload_retries: u32,

    /// Seconds before a single reload attempt is abandoned
    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,

    /// Seconds before a render-and-commit step is abandoned
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the event target in output
    #[serde(default)]
    pub target: bool,
}

fn default_server_id() -> String {
    "amneziawg".to_string()
}
fn default_listen_port() -> u16 {
    51820
}
fn default_subnet() -> Ipv4Net {
    "10.8.0.0/24".parse().expect("valid default subnet")
}
fn default_container_name() -> String {
    "amneziawg".to_string()
}
fn default_interface_name() -> String {
    "awg0".to_string()
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("/opt/amnezia/awg")
}
fn default_dns() -> [Ipv4Addr; 2] {
    [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
}
fn default_grace_period_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_lock_wait_secs() -> u64 {
    10
}
fn default_reload_retries() -> u32 {
    1
}
fn default_reload_timeout_secs() -> u64 {
    20
}
fn default_op_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            wait_secs: default_lock_wait_secs(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reload_retries: default_reload_retries(),
            reload_timeout_secs: default_reload_timeout_secs(),
            op_timeout_secs: default_op_timeout_secs(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

impl ServerSettings {
    /// Path of the active config file inside the shared directory
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface_name))
    }

    /// The gateway's tunnel address (explicit or the subnet's first host)
    pub fn gateway_address(&self) -> Ipv4Addr {
        self.gateway_address
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(self.subnet.trunc().network()) + 1))
    }
}

impl AllocatorSettings {
    /// Grace period as a [`Duration`]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Sweep cadence as a [`Duration`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.server.endpoint)
            .map_err(|e| ConfigError::ValidationError(format!("server.endpoint: {e}")))?;

        if self.server.listen_port == 0 {
            return Err(ConfigError::ValidationError(
                "server.listen_port cannot be 0".into(),
            ));
        }

        if self.server.subnet.prefix_len() > 30 {
            return Err(ConfigError::ValidationError(format!(
                "server.subnet {} has no allocatable host addresses",
                self.server.subnet
            )));
        }

        if let Some(gateway) = self.server.gateway_address {
            if !self.server.subnet.contains(&gateway) {
                return Err(ConfigError::ValidationError(format!(
                    "server.gateway_address {gateway} is outside subnet {}",
                    self.server.subnet
                )));
            }
        }

        if let Some(key) = &self.server.private_key {
            if !validate_key(key) {
                return Err(ConfigError::ValidationError(
                    "server.private_key is not a Base64-encoded 32-byte key".into(),
                ));
            }
        }

        if let Some(secret) = &self.server.master_secret {
            if !validate_key(secret) {
                return Err(ConfigError::ValidationError(
                    "server.master_secret must be 32 Base64-encoded bytes".into(),
                ));
            }
        }

        if let Some(obfuscation) = &self.server.obfuscation {
            obfuscation
                .validate()
                .map_err(|e| ConfigError::ValidationError(format!("server.obfuscation: {e}")))?;
        }

        if self.lock.ttl_secs == 0 {
            return Err(ConfigError::ValidationError("lock.ttl_secs cannot be 0".into()));
        }
        if self.sync.op_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync.op_timeout_secs cannot be 0".into(),
            ));
        }
        if self.allocator.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "allocator.sweep_interval_secs cannot be 0".into(),
            ));
        }

        Ok(())
    }

    /// A complete configuration with placeholder identity, for `-g`
    pub fn default_config() -> Self {
        Self {
            server: ServerSettings {
                id: default_server_id(),
                endpoint: "vpn.example.com:51820".into(),
                listen_port: default_listen_port(),
                subnet: default_subnet(),
                gateway_address: None,
                private_key: None,
                master_secret: None,
                container_name: default_container_name(),
                interface_name: default_interface_name(),
                config_dir: default_config_dir(),
                dns: default_dns(),
                obfuscation: Some(ObfuscationParams::default()),
            },
            allocator: AllocatorSettings::default(),
            lock: LockSettings::default(),
            sync: SyncSettings::default(),
            log: LogSettings::default(),
        }
    }

    /// Lifecycle timings derived from the lock/sync/allocator sections
    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            lock_ttl: Duration::from_secs(self.lock.ttl_secs),
            lock_wait: Duration::from_secs(self.lock.wait_secs),
            op_timeout: Duration::from_secs(self.sync.op_timeout_secs),
            grace_period: self.allocator.grace_period(),
        }
    }

    /// Build the manager's server context with the resolved private key
    pub fn server_context(&self, private_key: String) -> ServerContext {
        ServerContext {
            server_id: self.server.id.clone(),
            endpoint: self.server.endpoint.clone(),
            listen_port: self.server.listen_port,
            subnet: self.server.subnet,
            gateway_address: self.server.gateway_address(),
            private_key,
            dns: (self.server.dns[0], self.server.dns[1]),
            obfuscation: self.server.obfuscation,
        }
    }
}
