//! The persistence collaborator boundary
//!
//! Durable storage for peer records is external to this crate — the API
//! service owns its database. The lifecycle manager only sees [`PeerStore`],
//! which any backend with read-committed semantics can implement.
//!
//! [`MemoryPeerStore`] is the in-process implementation used by the
//! standalone binary and by tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use super::records::PeerRecord;

/// Error types for peer storage
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A record with this id already exists
    #[error("peer {0} already exists")]
    DuplicateId(Uuid),

    /// Another record already carries this public key
    #[error("public key already registered: {0}")]
    DuplicateKey(String),

    /// No record with this id
    #[error("peer not found: {0}")]
    NotFound(Uuid),

    /// Backend-specific failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable storage for peer records
///
/// Implementations must enforce public-key uniqueness across all records
/// (active and revoked) on both insert and update.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Fetch a record by id
    async fn get(&self, id: Uuid) -> Result<Option<PeerRecord>, StoreError>;

    /// Fetch a record by public key
    async fn find_by_public_key(&self, public_key: &str)
        -> Result<Option<PeerRecord>, StoreError>;

    /// All records, ordered by creation time then id
    async fn list(&self) -> Result<Vec<PeerRecord>, StoreError>;

    /// Insert a new record
    async fn insert(&self, record: PeerRecord) -> Result<(), StoreError>;

    /// Replace an existing record
    async fn update(&self, record: PeerRecord) -> Result<(), StoreError>;

    /// Delete a record, returning it if it existed
    async fn remove(&self, id: Uuid) -> Result<Option<PeerRecord>, StoreError>;
}

/// In-process peer store
pub struct MemoryPeerStore {
    peers: RwLock<BTreeMap<Uuid, PeerRecord>>,
}

impl MemoryPeerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryPeerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn get(&self, id: Uuid) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self.peers.read().get(&id).cloned())
    }

    async fn find_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self
            .peers
            .read()
            .values()
            .find(|record| record.public_key == public_key)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let mut records: Vec<PeerRecord> = self.peers.read().values().cloned().collect();
        records.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(records)
    }

    async fn insert(&self, record: PeerRecord) -> Result<(), StoreError> {
        let mut peers = self.peers.write();

        if peers.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        if peers
            .values()
            .any(|existing| existing.public_key == record.public_key)
        {
            return Err(StoreError::DuplicateKey(record.public_key));
        }

        peers.insert(record.id, record);
        Ok(())
    }

    async fn update(&self, record: PeerRecord) -> Result<(), StoreError> {
        let mut peers = self.peers.write();

        if !peers.contains_key(&record.id) {
            return Err(StoreError::NotFound(record.id));
        }
        if peers
            .values()
            .any(|existing| existing.id != record.id && existing.public_key == record.public_key)
        {
            return Err(StoreError::DuplicateKey(record.public_key));
        }

        peers.insert(record.id, record);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self.peers.write().remove(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::records::PeerStatus;
    use std::net::Ipv4Addr;
    use std::time::SystemTime;

    fn record(name: &str, key: &str, last_octet: u8) -> PeerRecord {
        PeerRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            public_key: key.into(),
            preshared_key: "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB=".into(),
            sealed_private_key: None,
            address: Ipv4Addr::new(10, 8, 0, last_octet),
            status: PeerStatus::Active,
            created_at: SystemTime::now(),
            revoked_at: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryPeerStore::new();
        let rec = record("laptop", "key-a", 2);

        store.insert(rec.clone()).await.unwrap();
        let fetched = store.get(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "laptop");

        let by_key = store.find_by_public_key("key-a").await.unwrap().unwrap();
        assert_eq!(by_key.id, rec.id);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key() {
        let store = MemoryPeerStore::new();
        store.insert(record("a", "same-key", 2)).await.unwrap();

        let err = store.insert(record("b", "same-key", 3)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_stealing_key() {
        let store = MemoryPeerStore::new();
        let a = record("a", "key-a", 2);
        let b = record("b", "key-b", 3);
        store.insert(a).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        let mut stolen = b.clone();
        stolen.public_key = "key-a".into();
        let err = store.update(stolen).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));

        // Updating without changing the key is fine
        let mut renamed = b;
        renamed.name = "b2".into();
        store.update(renamed).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = MemoryPeerStore::new();
        let err = store.update(record("ghost", "key-x", 9)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryPeerStore::new();
        let rec = record("a", "key-a", 2);
        store.insert(rec.clone()).await.unwrap();

        let removed = store.remove(rec.id).await.unwrap().unwrap();
        assert_eq!(removed.id, rec.id);
        assert!(store.get(rec.id).await.unwrap().is_none());
        assert!(store.remove(rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_ordered_by_creation() {
        let store = MemoryPeerStore::new();
        for (i, name) in ["first", "second", "third"].iter().enumerate() {
            let mut rec = record(name, &format!("key-{i}"), 2 + i as u8);
            rec.created_at = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(i as u64);
            store.insert(rec).await.unwrap();
        }

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }
}
