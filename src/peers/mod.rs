//! Peer records, storage, and lifecycle orchestration
//!
//! This module is the control surface the API layer consumes:
//!
//! - [`records`]: the durable peer data model
//! - [`store`]: the persistence collaborator boundary and an in-process store
//! - [`validation`]: input validation for names, endpoints, and keys
//! - [`manager`]: lock-held create/revoke/rotate orchestration
//!
//! # Consistency model
//!
//! The store is the source of truth for peer identity; the allocator and the
//! rendered config are derived from it. Every mutation re-renders and commits
//! the full config inside the same critical section that updates the store,
//! so the confirmed on-disk config is always a pure function of the active
//! peer set.

pub mod manager;
pub mod records;
pub mod store;
pub mod validation;

pub use manager::{
    CreatePeerRequest, EnrolledPeer, LifecycleError, LifecycleOptions, PeerLifecycleManager,
    ServerContext, ServerStatus,
};
pub use records::{PeerRecord, PeerStatus};
pub use store::{MemoryPeerStore, PeerStore, StoreError};
pub use validation::ValidationError;
