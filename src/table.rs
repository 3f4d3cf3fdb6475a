//! Flow identity and the shared flow table.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Size of the canonical hashable key slot.
pub const KEY_BYTES: usize = 16;

const SHARD_COUNT: usize = 16;

/// Canonical 5-tuple flow identifier. Fields are held in network byte order;
/// the 13 significant bytes plus three zero pad bytes fill a 16-byte slot so
/// equality and hashing cover a fixed-width value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: [u8; 2],
    dst_port: [u8; 2],
    proto: u8,
}

impl FlowKey {
    pub fn new(
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        proto: u8,
    ) -> Self {
        Self {
            src_ip: src_ip.octets(),
            dst_ip: dst_ip.octets(),
            src_port: src_port.to_be_bytes(),
            dst_port: dst_port.to_be_bytes(),
            proto,
        }
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port)
    }

    pub fn proto(&self) -> u8 {
        self.proto
    }

    /// The canonical 16-byte slot: src ip, dst ip, src port, dst port, proto,
    /// three zero pad bytes.
    pub fn to_bytes(&self) -> [u8; KEY_BYTES] {
        let mut bytes = [0u8; KEY_BYTES];
        bytes[0..4].copy_from_slice(&self.src_ip);
        bytes[4..8].copy_from_slice(&self.dst_ip);
        bytes[8..10].copy_from_slice(&self.src_port);
        bytes[10..12].copy_from_slice(&self.dst_port);
        bytes[12] = self.proto;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; KEY_BYTES]) -> Self {
        Self {
            src_ip: [bytes[0], bytes[1], bytes[2], bytes[3]],
            dst_ip: [bytes[4], bytes[5], bytes[6], bytes[7]],
            src_port: [bytes[8], bytes[9]],
            dst_port: [bytes[10], bytes[11]],
            proto: bytes[12],
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}/{}",
            self.src_ip(),
            self.src_port(),
            self.dst_ip(),
            self.dst_port(),
            self.proto
        )
    }
}

/// Per-flow state. `server_ip` is the backend the flow is pinned to; the
/// remaining fields carry the peer gateway's view of the flow while ECMP
/// reconvergence is being repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowState {
    pub server_ip: Ipv4Addr,
    pub dip: Ipv4Addr,
    pub dport: u16,
    pub bip: Ipv4Addr,
}

impl FlowState {
    /// State for a freshly installed flow: pinned to `server_ip`, peer view
    /// unset until replication fills it in.
    pub fn for_backend(server_ip: Ipv4Addr) -> Self {
        Self {
            server_ip,
            dip: Ipv4Addr::UNSPECIFIED,
            dport: 0,
            bip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InsertError {
    #[error("key already installed")]
    Duplicate,
    #[error("flow table full")]
    Full,
}

/// Bounded sharded map from `FlowKey` to `FlowState`. Single-key operations
/// are linearizable: each key lives in exactly one shard and every access to
/// it goes through that shard's lock. Readers copy the 16-byte value out, so
/// no caller can observe a torn state.
pub struct FlowTable {
    shards: Vec<RwLock<FxHashMap<FlowKey, FlowState>>>,
    occupancy: AtomicUsize,
    capacity: usize,
}

impl FlowTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(FxHashMap::default()))
            .collect();
        Self {
            shards,
            occupancy: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Install a new flow. Rejects keys that are already present and inserts
    /// that would exceed the configured capacity; a failed insert leaves the
    /// table untouched.
    pub fn insert(&self, key: FlowKey, state: FlowState) -> Result<(), InsertError> {
        let mut shard = self.shard(&key).write();
        match shard.entry(key) {
            Entry::Occupied(_) => Err(InsertError::Duplicate),
            Entry::Vacant(slot) => {
                if !self.reserve_slot() {
                    return Err(InsertError::Full);
                }
                slot.insert(state);
                Ok(())
            }
        }
    }

    /// Copy the state for `key` out of the table.
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowState> {
        self.shard(key).read().get(key).copied()
    }

    /// Install-or-overwrite, used when applying a state backup pushed by a
    /// peer. Overwriting an existing entry is idempotent; a new entry is
    /// still subject to the capacity bound.
    pub fn upsert(&self, key: FlowKey, state: FlowState) -> Result<(), InsertError> {
        let mut shard = self.shard(&key).write();
        match shard.entry(key) {
            Entry::Occupied(mut slot) => {
                slot.insert(state);
                Ok(())
            }
            Entry::Vacant(slot) => {
                if !self.reserve_slot() {
                    return Err(InsertError::Full);
                }
                slot.insert(state);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reserve_slot(&self) -> bool {
        // The occupancy gate is global across shards, so the reservation has
        // to be atomic even though the caller holds a shard lock.
        self.occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.capacity).then_some(used + 1)
            })
            .is_ok()
    }

    fn shard(&self, key: &FlowKey) -> &RwLock<FxHashMap<FlowKey, FlowState>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }
}
