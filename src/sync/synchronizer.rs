//! The commit state machine

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::reload::{DaemonReloader, ReloadError};
use super::revision::ConfigRevision;

/// Error types for config commits
#[derive(Debug, Error)]
pub enum SyncError {
    /// Writing the new config to the shared directory failed
    #[error("config write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The daemon would not reload; the previous config was restored
    #[error("daemon reload failed after {attempts} attempt(s), previous config restored: {source}")]
    ReloadFailed {
        /// How many reload attempts were made
        attempts: u32,
        /// The final reload failure
        #[source]
        source: ReloadError,
    },

    /// The daemon would not reload AND the previous config could not be
    /// restored; the daemon's view of the file is now unknown
    #[error("daemon reload failed and restoring the previous config also failed: {rollback}")]
    RollbackFailed {
        /// The error hit while restoring the backup
        #[source]
        rollback: std::io::Error,
    },
}

/// States a commit attempt moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitState {
    /// Nothing visible yet
    Pending,
    /// New text renamed over the active path
    Written,
    /// Daemon reload in flight
    ReloadRequested,
    /// Daemon acknowledged; live pointer advanced
    Confirmed,
    /// Reload failed; previous text restored
    RolledBack,
}

/// Result of a successful commit call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The revision is live and the daemon acknowledged it
    Confirmed,
    /// The revision's digest matched the live one; nothing was written
    Unchanged,
}

/// Snapshot of synchronizer health for the readiness probe
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    /// Number of the live (last Confirmed) revision
    pub live_revision: Option<u64>,
    /// Terminal state of the most recent commit attempt
    pub last_state: Option<CommitState>,
    /// Most recent commit error, if the last attempt failed
    pub last_error: Option<String>,
    /// Commit failures since the last success
    pub consecutive_failures: u32,
    /// Wall-clock time of the most recent attempt
    pub last_attempt_at: Option<SystemTime>,
}

#[derive(Default)]
struct StatusInner {
    last_state: Option<CommitState>,
    last_error: Option<String>,
    consecutive_failures: u32,
    last_attempt_at: Option<SystemTime>,
}

/// Owns every write to the daemon's config file
///
/// All mutations of the shared directory go through [`commit`], which the
/// lifecycle manager only calls while holding the per-server lease. Readers
/// of the live revision and the status snapshot never block.
///
/// [`commit`]: ConfigSynchronizer::commit
pub struct ConfigSynchronizer {
    config_path: PathBuf,
    backup_path: PathBuf,
    reloader: Arc<dyn DaemonReloader>,
    reload_retries: u32,
    live: ArcSwapOption<ConfigRevision>,
    status: Mutex<StatusInner>,
}

impl ConfigSynchronizer {
    /// Create a synchronizer for the given active config path
    ///
    /// The previous Confirmed revision is kept alongside the active file with
    /// a `.bak` suffix. `reload_retries` is how many extra reload attempts
    /// are made after the first failure before rolling back.
    pub fn new(
        config_path: impl Into<PathBuf>,
        reloader: Arc<dyn DaemonReloader>,
        reload_retries: u32,
    ) -> Self {
        let config_path = config_path.into();
        let backup_path = {
            let mut os = config_path.as_os_str().to_os_string();
            os.push(".bak");
            PathBuf::from(os)
        };

        Self {
            config_path,
            backup_path,
            reloader,
            reload_retries,
            live: ArcSwapOption::const_empty(),
            status: Mutex::new(StatusInner::default()),
        }
    }

    /// Path of the active config file
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// The live (last Confirmed) revision, if any commit has succeeded
    pub fn live_revision(&self) -> Option<Arc<ConfigRevision>> {
        self.live.load_full()
    }

    /// The number the next revision should carry
    pub fn next_number(&self) -> u64 {
        self.live.load().as_ref().map_or(1, |rev| rev.number() + 1)
    }

    /// Whether the most recent commit attempt succeeded
    ///
    /// `true` before any attempt has been made: a freshly started service is
    /// ready until a commit proves otherwise.
    pub fn is_ready(&self) -> bool {
        self.status.lock().consecutive_failures == 0
    }

    /// Health snapshot for operational tooling
    pub fn status(&self) -> SyncStatus {
        let inner = self.status.lock();
        SyncStatus {
            live_revision: self.live.load().as_ref().map(|rev| rev.number()),
            last_state: inner.last_state,
            last_error: inner.last_error.clone(),
            consecutive_failures: inner.consecutive_failures,
            last_attempt_at: inner.last_attempt_at,
        }
    }

    /// Commit a revision: write atomically, reload the daemon, roll back on
    /// reload failure
    ///
    /// # Errors
    ///
    /// - [`SyncError::Write`] — the new text never became visible; the active
    ///   file is untouched.
    /// - [`SyncError::ReloadFailed`] — the daemon rejected the reload; the
    ///   previous config was restored and stays live.
    /// - [`SyncError::RollbackFailed`] — reload failed and the restore also
    ///   failed; surfaced for operational escalation.
    pub async fn commit(&self, revision: ConfigRevision) -> Result<CommitOutcome, SyncError> {
        let previous = self.live.load_full();

        if let Some(prev) = &previous {
            if prev.digest() == revision.digest() {
                debug!(
                    revision = revision.number(),
                    digest = revision.digest(),
                    "config unchanged, skipping commit"
                );
                return Ok(CommitOutcome::Unchanged);
            }
        }

        self.status.lock().last_attempt_at = Some(SystemTime::now());
        debug!(revision = revision.number(), "commit pending");

        // Keep the prior Confirmed text as the on-disk backup before the
        // active file changes.
        if let Some(prev) = &previous {
            if let Err(e) = write_atomic(&self.backup_path, prev.text()).await {
                self.record_failure(CommitState::Pending, &e);
                return Err(SyncError::Write(e));
            }
        }

        if let Err(e) = write_atomic(&self.config_path, revision.text()).await {
            self.record_failure(CommitState::Pending, &e);
            return Err(SyncError::Write(e));
        }
        debug!(revision = revision.number(), "config written");

        let attempts = 1 + self.reload_retries;
        let mut attempt = 0;
        let reload_error = loop {
            attempt += 1;
            match self.reloader.reload().await {
                Ok(()) => {
                    let number = revision.number();
                    let digest = revision.digest().to_string();
                    self.live.store(Some(Arc::new(revision)));
                    self.record_success();
                    info!(revision = number, digest = %digest, "config revision confirmed");
                    return Ok(CommitOutcome::Confirmed);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "daemon reload failed");
                    if attempt >= attempts {
                        break e;
                    }
                }
            }
        };

        // Every reload attempt failed: restore the previous known-good text
        // so the daemon is never left pointing at an unacknowledged config.
        let rollback = match &previous {
            Some(prev) => write_atomic(&self.config_path, prev.text()).await,
            None => tokio::fs::remove_file(&self.config_path).await,
        };

        if let Err(rollback_err) = rollback {
            error!(
                error = %rollback_err,
                "rollback failed after reload failure; daemon config state unknown"
            );
            self.record_failure(CommitState::RolledBack, &rollback_err);
            return Err(SyncError::RollbackFailed {
                rollback: rollback_err,
            });
        }

        warn!(
            restored = previous.as_ref().map(|rev| rev.number()).unwrap_or(0),
            "previous config restored after reload failure"
        );
        self.record_failure(CommitState::RolledBack, &reload_error);
        Err(SyncError::ReloadFailed {
            attempts,
            source: reload_error,
        })
    }

    fn record_success(&self) {
        let mut inner = self.status.lock();
        inner.last_state = Some(CommitState::Confirmed);
        inner.last_error = None;
        inner.consecutive_failures = 0;
    }

    fn record_failure(&self, state: CommitState, error: &dyn std::fmt::Display) {
        let mut inner = self.status.lock();
        inner.last_state = Some(state);
        inner.last_error = Some(error.to_string());
        inner.consecutive_failures += 1;
        if inner.consecutive_failures > 1 {
            error!(
                failures = inner.consecutive_failures,
                "repeated commit failures; daemon may be unreachable"
            );
        }
    }
}

/// Write text to `path` so that a concurrent reader sees either the old file
/// or the new one, never a truncated mix: write a hidden temp file in the
/// same directory, fsync it, rename it over the target, fsync the directory.
async fn write_atomic(path: &Path, text: &str) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "config path has no parent directory",
        )
    })?;
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "config path has no file name",
        )
    })?;
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(text.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;

    // The rename itself must be durable before the daemon is signalled.
    #[cfg(unix)]
    {
        let dir_file = std::fs::File::open(dir)?;
        dir_file.sync_all()?;
    }

    Ok(())
}
