//! Peer lifecycle orchestration
//!
//! [`PeerLifecycleManager`] is the single entry point for every mutation of a
//! gateway's peer set. Each operation runs a lock-held critical section:
//!
//! 1. acquire the per-server lease
//! 2. mutate allocator state and the durable record
//! 3. re-render the full config from the active peer set
//! 4. commit it through the synchronizer (which reloads the daemon)
//!
//! Persisting and resynchronizing inside the same critical section is what
//! rules out lost updates: operation N's rendered config always includes the
//! effects of every operation that completed before it.
//!
//! # Failure compensation
//!
//! A failed commit must leave no partial effect behind. Each operation
//! restores whatever it changed — a created record is removed and its address
//! freed, a revocation is flipped back to active, a rotated key reverts —
//! before the error reaches the caller. The durable store never disagrees
//! with the confirmed on-disk config for longer than one critical section.
//!
//! # Cancellation
//!
//! The lease is acquired in the caller's own future, so cancelling an
//! operation that is still waiting for the lock has no side effects. Once
//! the lease is held, the critical section runs on a detached task: a caller
//! that stops waiting abandons only its read of the result, never the
//! mutation's durability or the lease release.
//!
//! # Reads
//!
//! Listing peers and reading status take no lock; they read the store and
//! the synchronizer's confirmed-revision pointer as-is.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ipnet::Ipv4Net;
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::{AddressPool, AllocError, PoolUtilization};
use crate::keys::{self, KeyError, SecretBox};
use crate::lock::{LeaseLock, LockError};
use crate::render::{
    render_client_config, render_server_config, ClientProfile, ObfuscationParams, PeerEntry,
    RenderError, ServerProfile,
};
use crate::sync::{CommitOutcome, ConfigRevision, ConfigSynchronizer, SyncError};

use super::records::{PeerRecord, PeerStatus};
use super::store::{PeerStore, StoreError};
use super::validation::{
    validate_endpoint, validate_peer_name, validate_public_key, ValidationError,
};

/// Error types for lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No free address; operator intervention required
    #[error("address pool exhausted")]
    PoolExhausted,

    /// The client-supplied public key is already registered
    #[error("public key already registered: {0}")]
    DuplicateKey(String),

    /// No peer with this id
    #[error("peer not found: {0}")]
    PeerNotFound(Uuid),

    /// The peer is revoked and cannot be operated on
    #[error("peer is revoked: {0}")]
    PeerRevoked(Uuid),

    /// The peer's private key was not retained, so its config cannot be
    /// re-issued
    #[error("private key not retained for peer {0}")]
    PrivateKeyUnavailable(Uuid),

    /// A critical-section step exceeded the operation timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Input validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The per-server lease could not be acquired in time
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Key generation or sealing failed
    #[error("key operation failed: {0}")]
    Key(#[from] KeyError),

    /// Allocator rejected an operation (other than exhaustion)
    #[error("allocator error: {0}")]
    Alloc(AllocError),

    /// Config rendering failed closed
    #[error("config render failed: {0}")]
    Render(#[from] RenderError),

    /// The config commit failed; all record changes were rolled back
    #[error("config sync failed: {0}")]
    Sync(#[from] SyncError),

    /// The persistence collaborator failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Runtime shutdown cancelled the critical-section task
    #[error("operation interrupted by shutdown")]
    Interrupted,
}

fn map_alloc(err: AllocError) -> LifecycleError {
    match err {
        AllocError::Exhausted(_) => LifecycleError::PoolExhausted,
        other => LifecycleError::Alloc(other),
    }
}

/// Await a detached critical section
///
/// The section runs on its own task, so a caller that stops waiting cancels
/// only its read of the result — the mutation still completes and the lease
/// is still released. Panics propagate to the awaiting caller.
async fn join_critical<T>(
    handle: tokio::task::JoinHandle<Result<T, LifecycleError>>,
) -> Result<T, LifecycleError> {
    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Err(LifecycleError::Interrupted),
    }
}

/// Static identity of the gateway this manager orchestrates
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Lease key and log label for this gateway
    pub server_id: String,
    /// Public `host:port` clients dial
    pub endpoint: String,
    /// UDP port the daemon listens on
    pub listen_port: u16,
    /// Tunnel subnet; peer addresses are allocated from it
    pub subnet: Ipv4Net,
    /// The gateway's own tunnel address
    pub gateway_address: Ipv4Addr,
    /// Gateway private key, Base64
    pub private_key: String,
    /// DNS servers pushed to clients
    pub dns: (Ipv4Addr, Ipv4Addr),
    /// Obfuscation parameters shared by gateway and clients
    pub obfuscation: Option<ObfuscationParams>,
}

/// Tunables for lifecycle critical sections
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Lease TTL; a crashed holder blocks the server for at most this long
    pub lock_ttl: Duration,
    /// How long a mutation waits for the lease before `LockTimeout`
    pub lock_wait: Duration,
    /// Upper bound on the render-and-commit step
    pub op_timeout: Duration,
    /// How long released addresses stay held before reuse
    pub grace_period: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(10),
            op_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(300),
        }
    }
}

/// Parameters for enrolling a new peer
#[derive(Debug, Clone, Default)]
pub struct CreatePeerRequest {
    /// Human-readable label
    pub name: String,
    /// Client-supplied public key; when absent the server generates the
    /// keypair and returns the private half once
    pub public_key: Option<String>,
    /// Optional expiry stored on the record
    pub expires_at: Option<SystemTime>,
}

/// Result of a successful enrollment or key rotation
///
/// `private_key` is the peer's plaintext private key and is populated only
/// when the server generated the keypair. This response is its single
/// disclosure; it is not recoverable later unless at-rest retention is
/// configured.
#[derive(Clone)]
pub struct EnrolledPeer {
    /// The durable record as persisted
    pub record: PeerRecord,
    /// Plaintext private key, present only for server-generated keys
    pub private_key: Option<String>,
    /// Rendered client config, present whenever the private key is known
    pub client_config: Option<String>,
}

impl std::fmt::Debug for EnrolledPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrolledPeer")
            .field("record", &self.record)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("client_config", &self.client_config.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Gateway status for the API layer and operational tooling
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Gateway identity
    pub server_id: String,
    /// Number of the confirmed on-disk revision
    pub live_revision: Option<u64>,
    /// Peers currently rendered into the config
    pub active_peers: usize,
    /// Address pool occupancy
    pub pool: PoolUtilization,
    /// Whether the most recent commit attempt succeeded
    pub ready: bool,
}

struct ManagerInner {
    ctx: ServerContext,
    server_public_key: String,
    store: Arc<dyn PeerStore>,
    lock: Arc<dyn LeaseLock>,
    synchronizer: Arc<ConfigSynchronizer>,
    pool: AddressPool,
    secret_box: Option<SecretBox>,
    opts: LifecycleOptions,
}

/// Orchestrates create/revoke/rotate across allocator, store, renderer, and
/// synchronizer
///
/// Cheap to clone; clones share one allocator and one lease namespace.
#[derive(Clone)]
pub struct PeerLifecycleManager {
    inner: Arc<ManagerInner>,
}

impl PeerLifecycleManager {
    /// Build a manager and restore allocator state from the store
    ///
    /// Validates the gateway identity, reserves the gateway's own address in
    /// the pool (when it falls inside the peer subnet), re-marks every active
    /// peer's address as allocated, and re-holds addresses of peers whose
    /// revocation is younger than the grace period.
    ///
    /// # Errors
    ///
    /// Fails fast on invalid gateway settings or on store contents that
    /// conflict with the pool (two peers on one address, a peer on the
    /// gateway address).
    pub async fn new(
        ctx: ServerContext,
        store: Arc<dyn PeerStore>,
        lock: Arc<dyn LeaseLock>,
        synchronizer: Arc<ConfigSynchronizer>,
        secret_box: Option<SecretBox>,
        opts: LifecycleOptions,
    ) -> Result<Self, LifecycleError> {
        validate_endpoint(&ctx.endpoint)?;
        let server_public_key = keys::derive_public_key(&ctx.private_key)?;
        if let Some(obfuscation) = &ctx.obfuscation {
            obfuscation.validate()?;
        }

        let pool = AddressPool::new(ctx.subnet, opts.grace_period).map_err(map_alloc)?;
        if pool.contains(ctx.gateway_address) {
            pool.reserve(ctx.gateway_address).map_err(map_alloc)?;
        }

        let records = store.list().await?;
        for record in &records {
            match record.status {
                PeerStatus::Active => {
                    pool.mark_allocated(record.address).map_err(map_alloc)?;
                }
                PeerStatus::Revoked => {
                    // A revocation younger than the grace period re-enters a
                    // full hold; deadlines are not persisted, so the hold is
                    // conservatively restarted.
                    let recent = record
                        .revoked_at
                        .and_then(|at| at.elapsed().ok())
                        .is_none_or(|elapsed| elapsed < opts.grace_period);
                    if recent && pool.mark_allocated(record.address).is_ok() {
                        let _ = pool.release(record.address);
                    }
                }
            }
        }

        info!(
            server = %ctx.server_id,
            subnet = %ctx.subnet,
            restored = records.len(),
            "peer lifecycle manager ready"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                ctx,
                server_public_key,
                store,
                lock,
                synchronizer,
                pool,
                secret_box,
                opts,
            }),
        })
    }

    /// The gateway's public key
    pub fn server_public_key(&self) -> &str {
        &self.inner.server_public_key
    }

    /// The gateway's address pool
    pub fn pool(&self) -> &AddressPool {
        &self.inner.pool
    }

    /// Enroll a new peer
    ///
    /// Allocation, persistence, and the config commit all happen under the
    /// per-server lease. On a failed commit the record is removed and the
    /// address freed immediately: no orphaned allocation survives.
    ///
    /// # Errors
    ///
    /// `PoolExhausted`, `DuplicateKey`, `LockTimeout` (via [`LockError`]),
    /// and `SyncFailed` (via [`SyncError`]) are the interesting cases; see
    /// [`LifecycleError`].
    pub async fn create_peer(
        &self,
        request: CreatePeerRequest,
    ) -> Result<EnrolledPeer, LifecycleError> {
        validate_peer_name(&request.name)?;
        if let Some(key) = &request.public_key {
            validate_public_key(key)?;
        }

        let lease = self.inner.acquire_lease().await?;
        let inner = Arc::clone(&self.inner);
        join_critical(tokio::spawn(async move {
            let _lease = lease;
            inner.create_peer_locked(request).await
        }))
        .await
    }

    /// Revoke a peer and schedule its address for reuse after the grace
    /// period
    pub async fn revoke_peer(&self, id: Uuid) -> Result<PeerRecord, LifecycleError> {
        let lease = self.inner.acquire_lease().await?;
        let inner = Arc::clone(&self.inner);
        join_critical(tokio::spawn(async move {
            let _lease = lease;
            inner.revoke_peer_locked(id).await
        }))
        .await
    }

    /// Replace a peer's keypair and preshared key
    ///
    /// The old key stops working atomically with the new config becoming
    /// live; the peer's id and address are unchanged, and the revision number
    /// advances by exactly one.
    pub async fn rotate_key(&self, id: Uuid) -> Result<EnrolledPeer, LifecycleError> {
        let lease = self.inner.acquire_lease().await?;
        let inner = Arc::clone(&self.inner);
        join_critical(tokio::spawn(async move {
            let _lease = lease;
            inner.rotate_key_locked(id).await
        }))
        .await
    }

    /// Rename a peer; metadata only, no config change
    pub async fn update_peer_name(
        &self,
        id: Uuid,
        name: &str,
    ) -> Result<PeerRecord, LifecycleError> {
        validate_peer_name(name)?;

        let _lease = self.inner.acquire_lease().await?;

        let mut record = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or(LifecycleError::PeerNotFound(id))?;
        record.name = name.to_string();
        self.inner.store.update(record.clone()).await?;
        Ok(record)
    }

    /// All peer records, active and revoked
    pub async fn list_peers(&self) -> Result<Vec<PeerRecord>, LifecycleError> {
        Ok(self.inner.store.list().await?)
    }

    /// Fetch one peer record
    pub async fn get_peer(&self, id: Uuid) -> Result<Option<PeerRecord>, LifecycleError> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Re-issue an active peer's client config from its sealed private key
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::PrivateKeyUnavailable`] when the key was
    /// client-supplied or at-rest retention is not configured.
    pub async fn client_config(&self, id: Uuid) -> Result<String, LifecycleError> {
        let record = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or(LifecycleError::PeerNotFound(id))?;
        if !record.is_active() {
            return Err(LifecycleError::PeerRevoked(id));
        }

        let sealed = record
            .sealed_private_key
            .as_ref()
            .ok_or(LifecycleError::PrivateKeyUnavailable(id))?;
        let seal = self
            .inner
            .secret_box
            .as_ref()
            .ok_or(LifecycleError::PrivateKeyUnavailable(id))?;
        let private_key = seal.open(sealed)?;

        Ok(render_client_config(&self.inner.client_profile(
            &private_key,
            record.address,
            &record.preshared_key,
        ))?)
    }

    /// Gateway status snapshot; no lock taken
    pub async fn server_status(&self) -> Result<ServerStatus, LifecycleError> {
        let records = self.inner.store.list().await?;
        Ok(ServerStatus {
            server_id: self.inner.ctx.server_id.clone(),
            live_revision: self
                .inner
                .synchronizer
                .live_revision()
                .map(|rev| rev.number()),
            active_peers: records.iter().filter(|r| r.is_active()).count(),
            pool: self.inner.pool.utilization(),
            ready: self.inner.synchronizer.is_ready(),
        })
    }

    /// Render and commit the config for the current active peer set
    ///
    /// Takes the per-server lease; used at startup to converge the on-disk
    /// file with the store, and by retry tooling after a `SyncFailed`.
    pub async fn synchronize(&self) -> Result<CommitOutcome, LifecycleError> {
        let lease = self.inner.acquire_lease().await?;
        let inner = Arc::clone(&self.inner);
        join_critical(tokio::spawn(async move {
            let _lease = lease;
            inner.resync().await
        }))
        .await
    }

    /// Run grace-period sweeps forever on the given cadence
    pub fn spawn_sweep_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.sweep_once().await;
            }
        })
    }

    /// One sweep pass: briefly takes the lease and frees expired holds
    ///
    /// Skips the pass instead of queueing behind a running mutation.
    pub async fn sweep_once(&self) {
        self.inner.sweep_once().await;
    }
}

impl ManagerInner {
    async fn acquire_lease(&self) -> Result<Box<dyn crate::lock::Lease>, LockError> {
        self.lock
            .acquire(&self.ctx.server_id, self.opts.lock_ttl, self.opts.lock_wait)
            .await
    }

    async fn create_peer_locked(
        &self,
        request: CreatePeerRequest,
    ) -> Result<EnrolledPeer, LifecycleError> {
        // Key material first: nothing to clean up if entropy fails
        let (keypair, public_key) = match &request.public_key {
            Some(key) => (None, key.clone()),
            None => {
                let pair = keys::generate_keypair()?;
                let public_key = pair.public_key.clone();
                (Some(pair), public_key)
            }
        };
        let preshared_key = keys::generate_preshared_key()?;

        if self.store.find_by_public_key(&public_key).await?.is_some() {
            return Err(LifecycleError::DuplicateKey(public_key));
        }

        let sealed_private_key = match (&keypair, &self.secret_box) {
            (Some(pair), Some(seal)) => Some(seal.seal(&pair.private_key)?),
            _ => None,
        };

        let address = self.pool.allocate().map_err(map_alloc)?;

        // Render the enrollment config before anything durable changes, so a
        // render failure aborts with no side effects.
        let client_config = match &keypair {
            Some(pair) => Some(render_client_config(&self.client_profile(
                &pair.private_key,
                address,
                &preshared_key,
            ))?),
            None => None,
        };

        let record = PeerRecord {
            id: Uuid::new_v4(),
            name: request.name,
            public_key,
            preshared_key,
            sealed_private_key,
            address,
            status: PeerStatus::Active,
            created_at: SystemTime::now(),
            revoked_at: None,
            expires_at: request.expires_at,
        };

        if let Err(err) = self.store.insert(record.clone()).await {
            let _ = self.pool.release_immediate(address);
            return Err(err.into());
        }

        if let Err(err) = self.resync().await {
            let _ = self.store.remove(record.id).await;
            let _ = self.pool.release_immediate(address);
            warn!(peer = %record.id, error = %err, "enrollment rolled back after failed commit");
            return Err(err);
        }

        info!(peer = %record.id, address = %address, "peer enrolled");

        Ok(EnrolledPeer {
            record,
            private_key: keypair.map(|pair| pair.private_key),
            client_config,
        })
    }

    async fn revoke_peer_locked(&self, id: Uuid) -> Result<PeerRecord, LifecycleError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(LifecycleError::PeerNotFound(id))?;
        if !record.is_active() {
            return Err(LifecycleError::PeerRevoked(id));
        }

        let mut revoked = record.clone();
        revoked.status = PeerStatus::Revoked;
        revoked.revoked_at = Some(SystemTime::now());
        self.store.update(revoked.clone()).await?;

        if let Err(err) = self.resync().await {
            let _ = self.store.update(record).await;
            warn!(peer = %id, error = %err, "revocation rolled back after failed commit");
            return Err(err);
        }

        if let Err(err) = self.pool.release(revoked.address) {
            warn!(peer = %id, address = %revoked.address, error = %err, "address release failed");
        }

        info!(peer = %id, address = %revoked.address, "peer revoked; address held for grace period");
        Ok(revoked)
    }

    async fn rotate_key_locked(&self, id: Uuid) -> Result<EnrolledPeer, LifecycleError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(LifecycleError::PeerNotFound(id))?;
        if !record.is_active() {
            return Err(LifecycleError::PeerRevoked(id));
        }

        let keypair = keys::generate_keypair()?;
        let preshared_key = keys::generate_preshared_key()?;
        let sealed_private_key = match &self.secret_box {
            Some(seal) => Some(seal.seal(&keypair.private_key)?),
            None => None,
        };

        let client_config = render_client_config(&self.client_profile(
            &keypair.private_key,
            record.address,
            &preshared_key,
        ))?;

        let mut rotated = record.clone();
        rotated.public_key = keypair.public_key.clone();
        rotated.preshared_key = preshared_key;
        rotated.sealed_private_key = sealed_private_key;
        self.store.update(rotated.clone()).await?;

        if let Err(err) = self.resync().await {
            let _ = self.store.update(record).await;
            warn!(peer = %id, error = %err, "key rotation rolled back after failed commit");
            return Err(err);
        }

        info!(peer = %id, "peer key rotated");

        Ok(EnrolledPeer {
            record: rotated,
            private_key: Some(keypair.private_key),
            client_config: Some(client_config),
        })
    }

    async fn sweep_once(&self) {
        // Zero wait: skip the pass instead of queueing behind a mutation
        match self
            .lock
            .acquire(&self.ctx.server_id, self.opts.lock_ttl, Duration::ZERO)
            .await
        {
            Ok(_lease) => {
                let freed = self.pool.sweep_expired(Instant::now());
                if freed > 0 {
                    info!(freed, "grace period expired; addresses returned to pool");
                }
            }
            Err(_) => debug!(server = %self.ctx.server_id, "sweep skipped; server busy"),
        }
    }

    /// Render the active peer set and commit it, bounded by the operation
    /// timeout. Callers hold the per-server lease.
    async fn resync(&self) -> Result<CommitOutcome, LifecycleError> {
        let records = self.store.list().await?;
        let entries: Vec<PeerEntry> = records
            .iter()
            .filter(|record| record.is_active())
            .map(|record| PeerEntry {
                public_key: record.public_key.clone(),
                preshared_key: record.preshared_key.clone(),
                address: record.address,
            })
            .collect();

        let profile = ServerProfile {
            private_key: self.ctx.private_key.clone(),
            address: self.ctx.gateway_address,
            prefix_len: self.ctx.subnet.prefix_len(),
            listen_port: self.ctx.listen_port,
            obfuscation: self.ctx.obfuscation,
        };

        let text = render_server_config(&profile, &entries)?;
        let revision = ConfigRevision::new(self.synchronizer.next_number(), text);

        let outcome = tokio::time::timeout(self.opts.op_timeout, self.synchronizer.commit(revision))
            .await
            .map_err(|_| LifecycleError::Timeout(self.opts.op_timeout))??;
        Ok(outcome)
    }

    fn client_profile(
        &self,
        private_key: &str,
        address: Ipv4Addr,
        preshared_key: &str,
    ) -> ClientProfile {
        ClientProfile {
            private_key: private_key.to_string(),
            address,
            preshared_key: preshared_key.to_string(),
            server_public_key: self.server_public_key.clone(),
            server_endpoint: self.ctx.endpoint.clone(),
            dns: self.ctx.dns,
            obfuscation: self.ctx.obfuscation,
        }
    }
}
