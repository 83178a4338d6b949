//! Daemon reload collaborator
//!
//! After a new config lands on disk, the daemon must be told to pick it up.
//! How that happens is deployment-specific (a `docker exec`, a process
//! signal, a remote administrative command), so the synchronizer only sees
//! the [`DaemonReloader`] trait. Tests substitute implementations that fail
//! on purpose to exercise the rollback path.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Error types for daemon reloads
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The reload command ran and reported failure
    #[error("reload command exited with status {status}: {stderr}")]
    CommandFailed {
        /// Process exit code (-1 if terminated by signal)
        status: i32,
        /// Trimmed stderr output
        stderr: String,
    },

    /// The reload command could not be started
    #[error("failed to invoke reload command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The reload did not complete in time
    #[error("reload timed out after {0:?}")]
    Timeout(Duration),
}

/// Triggers the daemon to reload its config from the shared path
#[async_trait]
pub trait DaemonReloader: Send + Sync {
    /// Ask the daemon to apply the config currently on disk
    async fn reload(&self) -> Result<(), ReloadError>;
}

/// Reloads the daemon inside its container via `awg syncconf`
///
/// Runs the daemon's own strip-and-sync sequence so the interface applies
/// peer changes without going down:
///
/// ```text
/// awg-quick strip <config> > /tmp/awg-sync.conf
/// awg syncconf <interface> /tmp/awg-sync.conf
/// ```
pub struct SyncconfReloader {
    container: String,
    interface: String,
    daemon_config_path: String,
    timeout: Duration,
}

impl SyncconfReloader {
    /// Create a reloader for the given container and interface
    ///
    /// `daemon_config_path` is the config path as seen from inside the
    /// container (the shared directory is bind-mounted at the same location
    /// on both sides in the stock deployment).
    pub fn new(
        container: impl Into<String>,
        interface: impl Into<String>,
        daemon_config_path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            container: container.into(),
            interface: interface.into(),
            daemon_config_path: daemon_config_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DaemonReloader for SyncconfReloader {
    async fn reload(&self) -> Result<(), ReloadError> {
        let script = format!(
            "awg-quick strip {path} > /tmp/awg-sync.conf && \
             awg syncconf {iface} /tmp/awg-sync.conf && \
             rm -f /tmp/awg-sync.conf",
            path = self.daemon_config_path,
            iface = self.interface,
        );

        debug!(container = %self.container, interface = %self.interface, "reloading daemon");

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("docker")
                .args(["exec", &self.container, "sh", "-c", &script])
                .output(),
        )
        .await
        .map_err(|_| ReloadError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ReloadError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}
