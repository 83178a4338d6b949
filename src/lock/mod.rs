//! Per-server mutual exclusion
//!
//! All mutating peer operations for one gateway serialize on a lease: a named
//! lock with a bounded time-to-live. Leases rather than plain mutexes because
//! the holder may be another service instance sharing the same config target,
//! and because a holder that crashes mid-operation must not wedge the server
//! forever — an expired lease is simply taken over by the next acquirer.
//!
//! The [`LeaseLock`] trait is the seam for multi-instance deployments (a
//! shared-store implementation slots in behind it). [`LocalLeaseLock`] is the
//! in-process implementation used by a single service instance and by every
//! test in this crate.
//!
//! Acquisition waits are bounded: a caller that cannot get the lease within
//! its wait budget gets [`LockError::Timeout`] and retries with backoff
//! upstream, never proceeding with stale state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// How often a blocked acquirer re-checks the lease table
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error types for lease acquisition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The lease stayed held for the whole wait budget
    #[error("timed out acquiring lease {key:?} after {waited:?}")]
    Timeout {
        /// The contended lease key
        key: String,
        /// How long the acquirer waited
        waited: Duration,
    },
}

/// A held lease; dropping it releases the lock
///
/// A lease that outlives its TTL is considered lost: another instance may
/// already hold a successor. Releasing a lost lease is a no-op rather than an
/// error, so a slow critical section cannot revoke its successor's lease.
pub trait Lease: Send + Sync + std::fmt::Debug {
    /// The key this lease covers
    fn key(&self) -> &str;

    /// When the lease expires
    fn expires_at(&self) -> Instant;

    /// Whether the TTL has already elapsed
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }
}

/// Lease-based lock provider
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquire the lease for `key`, waiting at most `wait`
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the lease is still held when the
    /// wait budget runs out.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Box<dyn Lease>, LockError>;
}

#[derive(Debug)]
struct LeaseEntry {
    token: u64,
    expires_at: Instant,
}

/// In-process lease table
pub struct LocalLeaseLock {
    leases: Arc<DashMap<String, LeaseEntry>>,
    next_token: AtomicU64,
}

impl LocalLeaseLock {
    /// Create an empty lease table
    pub fn new() -> Self {
        Self {
            leases: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LocalLease> {
        let now = Instant::now();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let expires_at = now + ttl;

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return None;
                }
                // Previous holder never released: crashed or overran its TTL
                warn!(key, "taking over expired lease");
                occupied.insert(LeaseEntry { token, expires_at });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LeaseEntry { token, expires_at });
            }
        }

        debug!(key, token, "lease acquired");
        Some(LocalLease {
            leases: Arc::clone(&self.leases),
            key: key.to_string(),
            token,
            expires_at,
        })
    }
}

impl Default for LocalLeaseLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseLock for LocalLeaseLock {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Box<dyn Lease>, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_acquire(key, ttl) {
                return Ok(Box::new(lease));
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }
}

#[derive(Debug)]
struct LocalLease {
    leases: Arc<DashMap<String, LeaseEntry>>,
    key: String,
    token: u64,
    expires_at: Instant,
}

impl Lease for LocalLease {
    fn key(&self) -> &str {
        &self.key
    }

    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        // Only release if the table still holds OUR lease; an expired lease
        // may have been taken over by a new holder.
        self.leases
            .remove_if(&self.key, |_, entry| entry.token == self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_and_release_on_drop() {
        let lock = LocalLeaseLock::new();

        let lease = lock.acquire("server-1", TTL, Duration::ZERO).await.unwrap();
        assert_eq!(lease.key(), "server-1");
        assert!(!lease.is_expired());
        drop(lease);

        // Released: immediate reacquire succeeds
        lock.acquire("server-1", TTL, Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let lock = LocalLeaseLock::new();

        let _held = lock.acquire("server-1", TTL, Duration::ZERO).await.unwrap();
        let err = lock
            .acquire("server-1", TTL, Duration::from_millis(30))
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let lock = LocalLeaseLock::new();

        let _a = lock.acquire("server-1", TTL, Duration::ZERO).await.unwrap();
        lock.acquire("server-2", TTL, Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let lock = LocalLeaseLock::new();

        // Simulated crashed holder: lease never dropped, tiny TTL
        let crashed = lock
            .acquire("server-1", Duration::from_millis(20), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(crashed.is_expired());

        // Next acquirer takes over without waiting for a release
        let _successor = lock.acquire("server-1", TTL, Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_drop_does_not_release_successor() {
        let lock = LocalLeaseLock::new();

        let crashed = lock
            .acquire("server-1", Duration::from_millis(20), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _successor = lock.acquire("server-1", TTL, Duration::ZERO).await.unwrap();
        drop(crashed);

        // The successor's lease must still be held
        let err = lock
            .acquire("server-1", TTL, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_blocked_acquire_proceeds_after_release() {
        let lock = Arc::new(LocalLeaseLock::new());

        let held = lock.acquire("server-1", TTL, Duration::ZERO).await.unwrap();

        let contender = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                lock.acquire("server-1", TTL, Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);

        let lease = contender.await.unwrap().unwrap();
        assert_eq!(lease.key(), "server-1");
    }
}
