//! Error types for awg-control
//!
//! Each subsystem defines its own error enum; this module aggregates them
//! into a single crate-level type with recovery hints. The classification
//! drives retry behavior in callers:
//!
//! - transient (lock contention, a rolled-back sync): retry with backoff
//! - caller errors (duplicate key, validation): report as-is, never retry
//! - exhaustion: surface to the operator; retrying cannot help
//! - entropy failure: fatal, the process should stop serving

use thiserror::Error;

use crate::allocator::AllocError;
use crate::config::ConfigError;
use crate::keys::KeyError;
use crate::lock::LockError;
use crate::peers::manager::LifecycleError;
use crate::peers::store::StoreError;
use crate::peers::validation::ValidationError;
use crate::render::RenderError;
use crate::sync::reload::ReloadError;
use crate::sync::synchronizer::SyncError;

/// Top-level error type for awg-control
#[derive(Debug, Error)]
pub enum AwgControlError {
    /// Configuration errors (file parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Key generation and sealing errors
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Address pool errors
    #[error("allocation error: {0}")]
    Alloc(#[from] AllocError),

    /// Config rendering errors
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// Config synchronization errors
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Daemon reload errors
    #[error("reload error: {0}")]
    Reload(#[from] ReloadError),

    /// Lease acquisition errors
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Peer store errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Input validation errors
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Lifecycle orchestration errors
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AwgControlError {
    /// Check if this error is recoverable (safe to retry the operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            // Entropy failure is fatal, key decode errors are caller errors
            Self::Key(_) => false,
            // Exhaustion needs operator intervention, everything else here
            // is a caller or programming error
            Self::Alloc(_) => false,
            Self::Render(_) => false,
            Self::Sync(e) => sync_recoverable(e),
            Self::Reload(_) => true,
            Self::Lock(LockError::Timeout { .. }) => true,
            Self::Store(e) => store_recoverable(e),
            Self::Validation(_) => false,
            Self::Lifecycle(e) => lifecycle_recoverable(e),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Check if this error should stop the process
    ///
    /// Only an entropy-source failure qualifies: a service that cannot
    /// generate keys must not keep accepting enrollments.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Key(KeyError::EntropyFailure(_))
                | Self::Lifecycle(LifecycleError::Key(KeyError::EntropyFailure(_)))
        )
    }
}

fn sync_recoverable(err: &SyncError) -> bool {
    match err {
        // The previous config was restored and the intended state is still
        // in the store, so a retry can resynchronize
        SyncError::ReloadFailed { .. } => true,
        SyncError::Write(_) => true,
        // The daemon's view of the file is unknown; escalate instead
        SyncError::RollbackFailed { .. } => false,
    }
}

fn store_recoverable(err: &StoreError) -> bool {
    matches!(err, StoreError::Backend(_))
}

fn lifecycle_recoverable(err: &LifecycleError) -> bool {
    match err {
        LifecycleError::PoolExhausted
        | LifecycleError::DuplicateKey(_)
        | LifecycleError::PeerNotFound(_)
        | LifecycleError::PeerRevoked(_)
        | LifecycleError::PrivateKeyUnavailable(_)
        | LifecycleError::Validation(_)
        | LifecycleError::Key(_)
        | LifecycleError::Alloc(_)
        | LifecycleError::Render(_) => false,
        LifecycleError::Timeout(_) | LifecycleError::Lock(_) | LifecycleError::Interrupted => true,
        LifecycleError::Sync(e) => sync_recoverable(e),
        LifecycleError::Store(e) => store_recoverable(e),
    }
}

/// Type alias for Result with [`AwgControlError`]
pub type Result<T> = std::result::Result<T, AwgControlError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lock_timeout_is_recoverable() {
        let err: AwgControlError = LockError::Timeout {
            key: "gw".into(),
            waited: Duration::from_secs(10),
        }
        .into();
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_pool_exhaustion_is_not_recoverable() {
        let err: AwgControlError = LifecycleError::PoolExhausted.into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_rolled_back_sync_is_recoverable() {
        let err: AwgControlError = LifecycleError::Sync(SyncError::ReloadFailed {
            attempts: 2,
            source: ReloadError::CommandFailed {
                status: 1,
                stderr: "down".into(),
            },
        })
        .into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_entropy_failure_is_fatal() {
        let err: AwgControlError = KeyError::EntropyFailure("rng closed".into()).into();
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_duplicate_key_is_caller_error() {
        let err: AwgControlError = LifecycleError::DuplicateKey("abc".into()).into();
        assert!(!err.is_recoverable());
        assert!(!err.is_fatal());
    }
}
