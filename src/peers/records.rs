//! Durable peer records

use std::net::Ipv4Addr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Peer registration status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Rendered into the daemon config
    Active,
    /// Excluded from the config; record retained for audit
    Revoked,
}

/// One VPN client registration
///
/// The record is the durable source of truth for a peer: the rendered config
/// is derived from the set of active records and can be regenerated at any
/// time. Identity is the `id`; the public key is a unique but *mutable*
/// attribute (key rotation replaces it while the id stays stable).
///
/// The private key, when retained at all, is stored sealed (see
/// [`crate::keys::SecretBox`]) — never in plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable peer identity
    pub id: Uuid,
    /// Human-readable label
    pub name: String,
    /// Current public key, Base64; unique among all records
    pub public_key: String,
    /// Tunnel preshared key, Base64
    pub preshared_key: String,
    /// Sealed private key; present only for server-generated keys on
    /// deployments that configured a master secret
    pub sealed_private_key: Option<String>,
    /// Allocated tunnel address
    pub address: Ipv4Addr,
    /// Registration status
    pub status: PeerStatus,
    /// When the peer was enrolled
    pub created_at: SystemTime,
    /// When the peer was revoked, if it was
    pub revoked_at: Option<SystemTime>,
    /// Optional expiry communicated to external policy; the crate stores it
    /// but does not enforce it
    pub expires_at: Option<SystemTime>,
}

impl PeerRecord {
    /// Whether the peer is rendered into the daemon config
    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Active
    }
}
