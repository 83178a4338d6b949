//! End-to-end lifecycle tests
//!
//! These drive the real component stack — memory store, local lease lock,
//! tempdir-backed synchronizer — with only the daemon reload stubbed, and
//! verify the consistency properties the orchestration core promises.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use awg_control::keys::generate_keypair;
use awg_control::lock::LocalLeaseLock;
use awg_control::peers::{
    CreatePeerRequest, LifecycleError, LifecycleOptions, MemoryPeerStore, PeerLifecycleManager,
    ServerContext,
};
use awg_control::sync::{ConfigSynchronizer, DaemonReloader, ReloadError, SyncError};

/// Reload stub that can be switched into a failing mode
struct ToggleReloader {
    fail: AtomicBool,
}

impl ToggleReloader {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DaemonReloader for ToggleReloader {
    async fn reload(&self) -> Result<(), ReloadError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(ReloadError::CommandFailed {
                status: 1,
                stderr: "interface down".into(),
            })
        } else {
            Ok(())
        }
    }
}

struct Fixture {
    manager: PeerLifecycleManager,
    reloader: Arc<ToggleReloader>,
    config_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

/// Build a full stack over a temp directory
///
/// The gateway address sits outside the peer subnet so every host address of
/// the pool is available for enrollment.
async fn fixture(subnet: &str, grace_period: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("awg0.conf");
    let reloader = ToggleReloader::new();
    let synchronizer = Arc::new(ConfigSynchronizer::new(
        config_path.clone(),
        Arc::clone(&reloader) as Arc<dyn DaemonReloader>,
        0,
    ));

    let ctx = ServerContext {
        server_id: "gw-test".into(),
        endpoint: "vpn.example.com:51820".into(),
        listen_port: 51820,
        subnet: subnet.parse().unwrap(),
        gateway_address: Ipv4Addr::new(10, 9, 0, 1),
        private_key: generate_keypair().unwrap().private_key,
        dns: (Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)),
        obfuscation: None,
    };

    let manager = PeerLifecycleManager::new(
        ctx,
        Arc::new(MemoryPeerStore::new()),
        Arc::new(LocalLeaseLock::new()),
        synchronizer,
        None,
        LifecycleOptions {
            grace_period,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    Fixture {
        manager,
        reloader,
        config_path,
        _dir: dir,
    }
}

fn request(name: &str) -> CreatePeerRequest {
    CreatePeerRequest {
        name: name.into(),
        ..Default::default()
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enrollments_fill_pool_exactly() {
    // 10.8.0.0/28 has 14 usable host addresses. 15 concurrent enrollments
    // must produce exactly 14 distinct addresses and one exhaustion error.
    let fx = fixture("10.8.0.0/28", Duration::from_secs(300)).await;

    let mut handles = Vec::new();
    for i in 0..15 {
        let manager = fx.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.create_peer(request(&format!("peer-{i}"))).await
        }));
    }

    let mut addresses = BTreeSet::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(enrolled) => {
                // No two callers may ever share an address
                assert!(addresses.insert(enrolled.record.address));
            }
            Err(LifecycleError::PoolExhausted) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(addresses.len(), 14);
    assert_eq!(exhausted, 1);

    let expected: BTreeSet<Ipv4Addr> = (1..=14u8).map(|i| Ipv4Addr::new(10, 8, 0, i)).collect();
    assert_eq!(addresses, expected);

    let status = fx.manager.server_status().await.unwrap();
    assert_eq!(status.active_peers, 14);
    assert_eq!(status.pool.free, 0);
}

// =============================================================================
// Sync failure compensation
// =============================================================================

#[tokio::test]
async fn failed_reload_rolls_back_enrollment() {
    let fx = fixture("10.8.0.0/28", Duration::from_secs(300)).await;

    fx.manager.create_peer(request("survivor")).await.unwrap();
    let before = std::fs::read_to_string(&fx.config_path).unwrap();
    let revision_before = fx.manager.server_status().await.unwrap().live_revision;

    fx.reloader.set_failing(true);
    let err = fx.manager.create_peer(request("doomed")).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Sync(SyncError::ReloadFailed { .. })
    ));

    // The record is gone, the allocation is freed, the visible file and the
    // live revision are exactly what they were before the call
    let peers = fx.manager.list_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "survivor");

    let status = fx.manager.server_status().await.unwrap();
    assert_eq!(status.pool.allocated, 1);
    assert_eq!(status.live_revision, revision_before);
    assert!(!status.ready);

    let after = std::fs::read_to_string(&fx.config_path).unwrap();
    assert_eq!(before, after);

    // Once the daemon recovers, the freed address is handed out again
    fx.reloader.set_failing(false);
    let retried = fx.manager.create_peer(request("doomed")).await.unwrap();
    assert_eq!(retried.record.address, Ipv4Addr::new(10, 8, 0, 2));
    assert!(fx.manager.server_status().await.unwrap().ready);
}

#[tokio::test]
async fn failed_reload_rolls_back_revocation() {
    let fx = fixture("10.8.0.0/28", Duration::from_secs(300)).await;

    let enrolled = fx.manager.create_peer(request("laptop")).await.unwrap();
    let before = std::fs::read_to_string(&fx.config_path).unwrap();

    fx.reloader.set_failing(true);
    let err = fx
        .manager
        .revoke_peer(enrolled.record.id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Sync(_)));

    // Still active, still allocated, config unchanged
    let peer = fx
        .manager
        .get_peer(enrolled.record.id)
        .await
        .unwrap()
        .unwrap();
    assert!(peer.is_active());
    assert_eq!(fx.manager.server_status().await.unwrap().pool.allocated, 1);
    assert_eq!(std::fs::read_to_string(&fx.config_path).unwrap(), before);
}

// =============================================================================
// Grace period
// =============================================================================

#[tokio::test]
async fn revoked_address_not_reused_before_grace_elapses() {
    let fx = fixture("10.8.0.0/28", Duration::from_secs(3600)).await;

    let first = fx.manager.create_peer(request("first")).await.unwrap();
    assert_eq!(first.record.address, Ipv4Addr::new(10, 8, 0, 1));

    fx.manager.revoke_peer(first.record.id).await.unwrap();

    // Even a sweep cannot free the hold before the grace period elapses
    fx.manager.sweep_once().await;

    let second = fx.manager.create_peer(request("second")).await.unwrap();
    assert_eq!(second.record.address, Ipv4Addr::new(10, 8, 0, 2));

    let status = fx.manager.server_status().await.unwrap();
    assert_eq!(status.pool.held, 1);
    assert_eq!(status.pool.allocated, 1);
}

#[tokio::test]
async fn expired_hold_is_reused_after_sweep() {
    // Zero grace period: the hold expires immediately, the next sweep frees it
    let fx = fixture("10.8.0.0/28", Duration::ZERO).await;

    let first = fx.manager.create_peer(request("first")).await.unwrap();
    fx.manager.revoke_peer(first.record.id).await.unwrap();
    fx.manager.sweep_once().await;

    let second = fx.manager.create_peer(request("second")).await.unwrap();
    assert_eq!(second.record.address, first.record.address);
}

// =============================================================================
// Key rotation
// =============================================================================

#[tokio::test]
async fn rotate_key_swaps_keys_and_bumps_revision_once() {
    let fx = fixture("10.8.0.0/28", Duration::from_secs(300)).await;

    let enrolled = fx.manager.create_peer(request("laptop")).await.unwrap();
    let old_key = enrolled.record.public_key.clone();
    let revision_before = fx
        .manager
        .server_status()
        .await
        .unwrap()
        .live_revision
        .unwrap();

    let rotated = fx.manager.rotate_key(enrolled.record.id).await.unwrap();

    assert_eq!(rotated.record.id, enrolled.record.id);
    assert_eq!(rotated.record.address, enrolled.record.address);
    assert_ne!(rotated.record.public_key, old_key);
    assert!(rotated.private_key.is_some());

    let config = std::fs::read_to_string(&fx.config_path).unwrap();
    assert!(!config.contains(&old_key));
    assert!(config.contains(&rotated.record.public_key));

    let revision_after = fx
        .manager
        .server_status()
        .await
        .unwrap()
        .live_revision
        .unwrap();
    assert_eq!(revision_after, revision_before + 1);
}

#[tokio::test]
async fn failed_reload_rolls_back_rotation() {
    let fx = fixture("10.8.0.0/28", Duration::from_secs(300)).await;

    let enrolled = fx.manager.create_peer(request("laptop")).await.unwrap();
    let old_key = enrolled.record.public_key.clone();

    fx.reloader.set_failing(true);
    let err = fx.manager.rotate_key(enrolled.record.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Sync(_)));

    let peer = fx
        .manager
        .get_peer(enrolled.record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer.public_key, old_key);

    let config = std::fs::read_to_string(&fx.config_path).unwrap();
    assert!(config.contains(&old_key));
}

// =============================================================================
// Commit atomicity
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_partial_configs() {
    let fx = fixture("10.8.0.0/24", Duration::ZERO).await;

    fx.manager.create_peer(request("seed")).await.unwrap();

    // A reader hammering the active path must only ever see structurally
    // complete configs, no matter how many commits race past it.
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        let path = fx.config_path.clone();
        std::thread::spawn(move || {
            let mut reads = 0u32;
            while !done.load(Ordering::SeqCst) {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    reads += 1;
                    assert!(
                        content.starts_with("[Interface]\nPrivateKey = "),
                        "truncated head: {content:?}"
                    );
                    assert!(content.ends_with('\n'), "truncated tail: {content:?}");
                    // Every peer block is complete
                    let blocks = content.matches("[Peer]").count();
                    let keys = content.matches("PresharedKey = ").count();
                    assert_eq!(blocks, keys, "partial peer block: {content:?}");
                }
            }
            reads
        })
    };

    let mut ids = Vec::new();
    for i in 0..20 {
        let enrolled = fx
            .manager
            .create_peer(request(&format!("peer-{i}")))
            .await
            .unwrap();
        ids.push(enrolled.record.id);
    }
    for id in ids {
        fx.manager.revoke_peer(id).await.unwrap();
    }

    done.store(true, Ordering::SeqCst);
    let reads = reader.join().unwrap();
    assert!(reads > 0, "reader never sampled the config");
}

// =============================================================================
// Status surface
// =============================================================================

#[tokio::test]
async fn server_status_tracks_lifecycle() {
    let fx = fixture("10.8.0.0/28", Duration::from_secs(300)).await;

    let initial = fx.manager.server_status().await.unwrap();
    assert_eq!(initial.active_peers, 0);
    assert_eq!(initial.live_revision, None);
    assert!(initial.ready);

    let a = fx.manager.create_peer(request("a")).await.unwrap();
    fx.manager.create_peer(request("b")).await.unwrap();

    let status = fx.manager.server_status().await.unwrap();
    assert_eq!(status.active_peers, 2);
    assert_eq!(status.live_revision, Some(2));
    assert_eq!(status.pool.capacity, 14);
    assert_eq!(status.pool.free, 12);

    fx.manager.revoke_peer(a.record.id).await.unwrap();
    let status = fx.manager.server_status().await.unwrap();
    assert_eq!(status.active_peers, 1);
    assert_eq!(status.live_revision, Some(3));

    // Revoked peers remain listed for audit
    assert_eq!(fx.manager.list_peers().await.unwrap().len(), 2);
}
