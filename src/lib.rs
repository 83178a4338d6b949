//! awg-control: configuration orchestration for an AmneziaWG gateway
//!
//! This crate owns the control plane of a WireGuard-family VPN gateway whose
//! daemon runs in an externally managed container: peer identity, address
//! allocation, deterministic config rendering, and safe synchronization of
//! that state with the daemon's on-disk config — across concurrent requests
//! and across service instances sharing one config target.
//!
//! The data plane (packet encryption and routing) belongs entirely to the
//! daemon; this crate only ever writes its config file and asks it to reload.
//!
//! # Architecture
//!
//! ```text
//! API layer ──> PeerLifecycleManager ──> AddressPool
//!                     │    (per-server lease held)
//!                     ├──> PeerStore          (durable records)
//!                     ├──> render::*          (deterministic config text)
//!                     └──> ConfigSynchronizer (atomic write + daemon reload)
//!                                │
//!                          shared directory ──> AmneziaWG daemon
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use awg_control::config::load_config;
//! use awg_control::keys::generate_keypair;
//! use awg_control::lock::LocalLeaseLock;
//! use awg_control::peers::{CreatePeerRequest, MemoryPeerStore, PeerLifecycleManager};
//! use awg_control::sync::{ConfigSynchronizer, SyncconfReloader};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/awg-control/config.json")?;
//!
//! let reloader = Arc::new(SyncconfReloader::new(
//!     &config.server.container_name,
//!     &config.server.interface_name,
//!     config.server.config_path().display().to_string(),
//!     Duration::from_secs(config.sync.reload_timeout_secs),
//! ));
//! let synchronizer = Arc::new(ConfigSynchronizer::new(
//!     config.server.config_path(),
//!     reloader,
//!     config.sync.reload_retries,
//! ));
//!
//! let private_key = generate_keypair()?.private_key;
//! let manager = PeerLifecycleManager::new(
//!     config.server_context(private_key),
//!     Arc::new(MemoryPeerStore::new()),
//!     Arc::new(LocalLeaseLock::new()),
//!     synchronizer,
//!     None,
//!     config.lifecycle_options(),
//! )
//! .await?;
//!
//! let enrolled = manager
//!     .create_peer(CreatePeerRequest {
//!         name: "laptop".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("{}", enrolled.client_config.unwrap());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`allocator`]: address pool with grace-period holds
//! - [`config`]: service configuration types and loading
//! - [`error`]: crate-level error type and recovery hints
//! - [`keys`]: X25519 keypairs, preshared keys, at-rest sealing
//! - [`lock`]: lease-based per-server mutual exclusion
//! - [`peers`]: peer records, storage boundary, lifecycle orchestration
//! - [`render`]: deterministic daemon and client config text
//! - [`sync`]: atomic config commits and daemon reloads

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod allocator;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod peers;
pub mod render;
pub mod sync;

// Re-export commonly used types at the crate root
pub use allocator::{AddressPool, AllocError, PoolUtilization};
pub use config::{Config, ConfigError};
pub use error::{AwgControlError, Result};
pub use keys::{generate_keypair, generate_preshared_key, KeyError, Keypair, SecretBox};
pub use lock::{LeaseLock, LocalLeaseLock, LockError};
pub use peers::{
    CreatePeerRequest, EnrolledPeer, LifecycleError, MemoryPeerStore, PeerLifecycleManager,
    PeerRecord, PeerStatus, PeerStore, ServerContext, ServerStatus,
};
pub use render::{ObfuscationParams, RenderError};
pub use sync::{ConfigRevision, ConfigSynchronizer, DaemonReloader, SyncError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
