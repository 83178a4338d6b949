//! Peer address allocation
//!
//! Each gateway owns one contiguous IPv4 pool from which peer tunnel addresses
//! are assigned. The pool hands out the lowest free host address first, which
//! keeps allocation deterministic and makes test failures reproducible.
//!
//! # Grace-period holds
//!
//! A released address is not immediately reusable: client devices cache their
//! tunnel address, and handing it to a new peer while a revoked client may
//! still attempt handshakes invites confusing routing. Released addresses sit
//! in a hold until a background sweep moves them back to the free list after
//! the configured grace period. [`AddressPool::release_immediate`] bypasses
//! the hold for administrative reclamation.
//!
//! The sweep is a periodic pass driven from outside the request path; the
//! allocate path never scans hold deadlines.
//!
//! # Reservations
//!
//! The gateway's own interface address (and any static assignment) is pinned
//! with [`AddressPool::reserve`] and never enters the free list.
//!
//! # Thread safety
//!
//! Pool state lives behind a `parking_lot::RwLock`. Mutating peer operations
//! are additionally serialized by the per-server lease, so the lock here only
//! guards against concurrent readers of utilization counters.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

/// Error types for address allocation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    /// Every host address is allocated, reserved, or held
    #[error("no available addresses in {0}")]
    Exhausted(Ipv4Net),

    /// The address is already assigned to a peer
    #[error("address {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    /// The address is pinned outside the free list
    #[error("address {0} is reserved")]
    Reserved(Ipv4Addr),

    /// The address is not a host address of this pool
    #[error("address {0} is outside pool {1}")]
    OutOfRange(Ipv4Addr, Ipv4Net),

    /// The address is not currently assigned
    #[error("address {0} is not allocated")]
    NotAllocated(Ipv4Addr),

    /// The address is waiting out its grace period
    #[error("address {0} is in its grace period")]
    InGracePeriod(Ipv4Addr),

    /// The subnet has no allocatable host addresses (prefix longer than /30)
    #[error("subnet {0} has no allocatable host addresses")]
    UnusableSubnet(Ipv4Net),
}

/// Counters describing pool occupancy
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolUtilization {
    /// Total host addresses in the pool (network and broadcast excluded)
    pub capacity: usize,
    /// Addresses assigned to active peers
    pub allocated: usize,
    /// Addresses waiting out their grace period
    pub held: usize,
    /// Addresses pinned outside the free list
    pub reserved: usize,
    /// Addresses available for allocation
    pub free: usize,
}

struct PoolState {
    allocated: BTreeSet<Ipv4Addr>,
    reserved: BTreeSet<Ipv4Addr>,
    /// Held address -> hold expiry deadline
    held: BTreeMap<Ipv4Addr, Instant>,
    /// Lowest host offset that might be free; everything below is taken
    cursor: u32,
}

/// IPv4 address pool with reservations and grace-period holds
pub struct AddressPool {
    network: Ipv4Net,
    first_host: u32,
    last_host: u32,
    grace_period: Duration,
    state: RwLock<PoolState>,
}

impl AddressPool {
    /// Create a pool over the given subnet
    ///
    /// The network and broadcast addresses are excluded; the subnet must be
    /// /30 or wider to have any allocatable hosts.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::UnusableSubnet`] for /31 and /32 subnets.
    pub fn new(subnet: Ipv4Net, grace_period: Duration) -> Result<Self, AllocError> {
        if subnet.prefix_len() > 30 {
            return Err(AllocError::UnusableSubnet(subnet));
        }

        let network = subnet.trunc();
        let first_host = u32::from(network.network()) + 1;
        let last_host = u32::from(network.broadcast()) - 1;

        Ok(Self {
            network,
            first_host,
            last_host,
            grace_period,
            state: RwLock::new(PoolState {
                allocated: BTreeSet::new(),
                reserved: BTreeSet::new(),
                held: BTreeMap::new(),
                cursor: first_host,
            }),
        })
    }

    /// The pool's subnet
    pub fn subnet(&self) -> Ipv4Net {
        self.network
    }

    /// The configured grace period for released addresses
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Total host addresses in the pool
    pub fn capacity(&self) -> usize {
        (self.last_host - self.first_host + 1) as usize
    }

    /// Whether the address is a host address of this pool
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let bits = u32::from(addr);
        bits >= self.first_host && bits <= self.last_host
    }

    /// Allocate the lowest free host address
    ///
    /// Addresses that are allocated, reserved, or waiting out a grace period
    /// are skipped. The scan starts at a cursor below which every address is
    /// known to be taken, so the common case inspects a single candidate.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Exhausted`] when no address is free.
    pub fn allocate(&self) -> Result<Ipv4Addr, AllocError> {
        let mut state = self.state.write();

        let start = state.cursor.max(self.first_host);
        for bits in start..=self.last_host {
            let addr = Ipv4Addr::from(bits);
            if state.allocated.contains(&addr)
                || state.reserved.contains(&addr)
                || state.held.contains_key(&addr)
            {
                continue;
            }
            state.allocated.insert(addr);
            state.cursor = bits + 1;
            return Ok(addr);
        }

        Err(AllocError::Exhausted(self.network))
    }

    /// Pin a specific address outside the free list
    ///
    /// Used for the gateway's own interface address and static assignments.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is outside the pool, already
    /// allocated, or in a grace hold.
    pub fn reserve(&self, addr: Ipv4Addr) -> Result<(), AllocError> {
        self.check_range(addr)?;
        let mut state = self.state.write();

        if state.allocated.contains(&addr) {
            return Err(AllocError::AlreadyAllocated(addr));
        }
        if state.held.contains_key(&addr) {
            return Err(AllocError::InGracePeriod(addr));
        }
        state.reserved.insert(addr);
        Ok(())
    }

    /// Claim a specific free address as allocated
    ///
    /// Used at startup to restore allocator state from the set of active peer
    /// records.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is outside the pool or not free.
    pub fn mark_allocated(&self, addr: Ipv4Addr) -> Result<(), AllocError> {
        self.check_range(addr)?;
        let mut state = self.state.write();

        if state.allocated.contains(&addr) {
            return Err(AllocError::AlreadyAllocated(addr));
        }
        if state.reserved.contains(&addr) {
            return Err(AllocError::Reserved(addr));
        }
        if state.held.contains_key(&addr) {
            return Err(AllocError::InGracePeriod(addr));
        }
        state.allocated.insert(addr);
        Ok(())
    }

    /// Release an allocated address into its grace-period hold
    ///
    /// The address becomes allocatable again only after the grace period
    /// elapses and a sweep moves it back to the free list.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NotAllocated`] if the address is not currently
    /// assigned.
    pub fn release(&self, addr: Ipv4Addr) -> Result<(), AllocError> {
        let mut state = self.state.write();

        if !state.allocated.remove(&addr) {
            return Err(AllocError::NotAllocated(addr));
        }
        state.held.insert(addr, Instant::now() + self.grace_period);
        Ok(())
    }

    /// Free an address immediately, bypassing the grace period
    ///
    /// Accepts both allocated and held addresses; used for administrative
    /// reclamation and for undoing an allocation whose operation failed
    /// before becoming visible.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NotAllocated`] if the address is neither
    /// allocated nor held.
    pub fn release_immediate(&self, addr: Ipv4Addr) -> Result<(), AllocError> {
        let mut state = self.state.write();

        if state.allocated.remove(&addr) || state.held.remove(&addr).is_some() {
            state.cursor = state.cursor.min(u32::from(addr));
            return Ok(());
        }
        Err(AllocError::NotAllocated(addr))
    }

    /// Move expired holds back to the free list
    ///
    /// Called from the periodic sweep task, never from the allocate path.
    /// Returns the number of addresses freed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut state = self.state.write();

        let expired: Vec<Ipv4Addr> = state
            .held
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &expired {
            state.held.remove(addr);
            state.cursor = state.cursor.min(u32::from(*addr));
        }
        expired.len()
    }

    /// Whether the address is currently assigned to a peer
    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        self.state.read().allocated.contains(&addr)
    }

    /// Whether the address is waiting out its grace period
    pub fn is_held(&self, addr: Ipv4Addr) -> bool {
        self.state.read().held.contains_key(&addr)
    }

    /// Current occupancy counters
    pub fn utilization(&self) -> PoolUtilization {
        let state = self.state.read();
        let capacity = self.capacity();
        let allocated = state.allocated.len();
        let held = state.held.len();
        let reserved = state.reserved.len();
        PoolUtilization {
            capacity,
            allocated,
            held,
            reserved,
            free: capacity - allocated - held - reserved,
        }
    }

    fn check_range(&self, addr: Ipv4Addr) -> Result<(), AllocError> {
        if self.contains(addr) {
            Ok(())
        } else {
            Err(AllocError::OutOfRange(addr, self.network))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(subnet: &str, grace: Duration) -> AddressPool {
        AddressPool::new(subnet.parse().unwrap(), grace).unwrap()
    }

    #[test]
    fn test_allocate_lowest_first() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);

        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 3));
    }

    #[test]
    fn test_slash_28_capacity() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);
        assert_eq!(pool.capacity(), 14);

        for i in 1..=14u8 {
            assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, i));
        }
        assert!(matches!(pool.allocate(), Err(AllocError::Exhausted(_))));
    }

    #[test]
    fn test_network_and_broadcast_never_allocated() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);
        while pool.allocate().is_ok() {}
        assert!(!pool.is_allocated(Ipv4Addr::new(10, 8, 0, 0)));
        assert!(!pool.is_allocated(Ipv4Addr::new(10, 8, 0, 15)));
    }

    #[test]
    fn test_unusable_subnets_rejected() {
        for subnet in ["10.8.0.0/31", "10.8.0.1/32"] {
            let parsed: Ipv4Net = subnet.parse().unwrap();
            assert!(matches!(
                AddressPool::new(parsed, Duration::ZERO),
                Err(AllocError::UnusableSubnet(_))
            ));
        }
    }

    #[test]
    fn test_reserved_address_skipped() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);
        pool.reserve(Ipv4Addr::new(10, 8, 0, 1)).unwrap();

        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(pool.utilization().reserved, 1);
    }

    #[test]
    fn test_reserve_out_of_range() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);
        assert!(matches!(
            pool.reserve(Ipv4Addr::new(192, 168, 1, 1)),
            Err(AllocError::OutOfRange(..))
        ));
    }

    #[test]
    fn test_released_address_held_until_sweep() {
        let pool = pool("10.8.0.0/30", Duration::ZERO);

        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.release(a).unwrap();

        // Held, not free: pool is exhausted even though `a` was released
        assert!(pool.is_held(a));
        assert!(matches!(pool.allocate(), Err(AllocError::Exhausted(_))));

        // Zero grace period: the next sweep frees it
        assert_eq!(pool.sweep_expired(Instant::now()), 1);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn test_unexpired_hold_survives_sweep() {
        let pool = pool("10.8.0.0/28", Duration::from_secs(3600));

        let a = pool.allocate().unwrap();
        pool.release(a).unwrap();

        assert_eq!(pool.sweep_expired(Instant::now()), 0);
        assert!(pool.is_held(a));
        // Lowest-free skips the held address
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 2));
    }

    #[test]
    fn test_release_immediate_reuses_lowest() {
        let pool = pool("10.8.0.0/28", Duration::from_secs(3600));

        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        let _c = pool.allocate().unwrap();

        pool.release_immediate(a).unwrap();
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn test_release_immediate_reclaims_held() {
        let pool = pool("10.8.0.0/28", Duration::from_secs(3600));

        let a = pool.allocate().unwrap();
        pool.release(a).unwrap();
        assert!(pool.is_held(a));

        pool.release_immediate(a).unwrap();
        assert!(!pool.is_held(a));
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn test_release_requires_allocation() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);
        assert!(matches!(
            pool.release(Ipv4Addr::new(10, 8, 0, 5)),
            Err(AllocError::NotAllocated(_))
        ));
    }

    #[test]
    fn test_mark_allocated_restores_state() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);

        pool.mark_allocated(Ipv4Addr::new(10, 8, 0, 3)).unwrap();
        pool.mark_allocated(Ipv4Addr::new(10, 8, 0, 1)).unwrap();

        assert!(matches!(
            pool.mark_allocated(Ipv4Addr::new(10, 8, 0, 3)),
            Err(AllocError::AlreadyAllocated(_))
        ));

        // .1 and .3 taken, lowest free is .2
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 4));
    }

    #[test]
    fn test_allocated_and_held_stay_disjoint() {
        let pool = pool("10.8.0.0/28", Duration::from_secs(3600));

        let mut allocated = Vec::new();
        for _ in 0..6 {
            allocated.push(pool.allocate().unwrap());
        }
        for addr in allocated.iter().take(3) {
            pool.release(*addr).unwrap();
        }

        for addr in allocated.iter().take(3) {
            assert!(pool.is_held(*addr));
            assert!(!pool.is_allocated(*addr));
        }
        for addr in allocated.iter().skip(3) {
            assert!(pool.is_allocated(*addr));
            assert!(!pool.is_held(*addr));
        }

        let util = pool.utilization();
        assert_eq!(util.allocated, 3);
        assert_eq!(util.held, 3);
        assert_eq!(util.free, 8);
    }

    #[test]
    fn test_utilization_counters() {
        let pool = pool("10.8.0.0/28", Duration::ZERO);
        pool.reserve(Ipv4Addr::new(10, 8, 0, 1)).unwrap();
        pool.allocate().unwrap();
        pool.allocate().unwrap();

        let util = pool.utilization();
        assert_eq!(util.capacity, 14);
        assert_eq!(util.reserved, 1);
        assert_eq!(util.allocated, 2);
        assert_eq!(util.held, 0);
        assert_eq!(util.free, 11);
    }

    #[test]
    fn test_subnet_with_host_bits_normalized() {
        let pool = pool("10.8.0.5/28", Duration::ZERO);
        assert_eq!(pool.subnet().to_string(), "10.8.0.0/28");
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 8, 0, 1));
    }
}
