//! Config synchronization with the live daemon
//!
//! The daemon reads one file from a shared, bind-mounted directory. This
//! module owns every write to that file and guarantees the daemon never
//! observes a half-written config:
//!
//! 1. The rendered text is written to a hidden temp file in the same
//!    directory and fsynced.
//! 2. The temp file is atomically renamed over the active path.
//! 3. The daemon is told to reload. If the reload fails after its retries,
//!    the previously confirmed text is restored the same way, so the visible
//!    file always matches a config the daemon has acknowledged.
//!
//! A commit attempt walks a fixed state machine:
//!
//! ```text
//! Pending -> Written -> ReloadRequested -> Confirmed
//!                                       \-> RolledBack
//! ```
//!
//! Only `Confirmed` advances the live-revision pointer, which readers access
//! lock-free through `ArcSwap`. Revisions are immutable snapshots carrying a
//! SHA-256 digest; a commit whose digest matches the live revision is skipped
//! outright.
//!
//! # Submodules
//!
//! - [`revision`]: immutable rendered snapshots
//! - [`reload`]: the daemon-reload collaborator boundary
//! - [`synchronizer`]: the commit state machine

pub mod reload;
pub mod revision;
pub mod synchronizer;

pub use reload::{DaemonReloader, ReloadError, SyncconfReloader};
pub use revision::ConfigRevision;
pub use synchronizer::{
    CommitOutcome, CommitState, ConfigSynchronizer, SyncError, SyncStatus,
};
