//! # Shard Manager & Sharding Scheme
//!
//! Maps a content hash to the machine responsible for it in the
//! datacenter-wide index. The scheme is a consistent-hashing ring of
//! virtual nodes: every shard contributes `VNODES_PER_SHARD` points keyed
//! by sha256 of its id-salted vnode index, and a hash is owned by the first
//! available shard at or after the hash's own point.
//!
//! Properties relied on elsewhere:
//! - deterministic — every machine computes the same owner from the same
//!   shard list;
//! - stable — inserting or removing one shard only moves the keys that the
//!   changed shard gains or loses (O(1/N) of the keyspace);
//! - unavailable shards are skipped at lookup, so their keys fail over
//!   without rebuilding the ring.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use dclt_common::{Result, TrackerError};
use dclt_proto::{ContentHash, MachineId};

use crate::cell::ClusterStateCell;
use crate::state::ClusterState;

/// Virtual nodes contributed by each shard.
pub const VNODES_PER_SHARD: u32 = 64;

/// One shard as seen by the sharding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardEntry {
    pub id: MachineId,
    pub available: bool,
}

/// Derive the ordered shard list from a cluster snapshot.
/// "Available" means the record is Open or Closed.
pub fn shard_list(state: &ClusterState) -> Vec<ShardEntry> {
    state
        .records()
        .map(|r| ShardEntry {
            id: r.id,
            available: r.state.is_available(),
        })
        .collect()
}

fn vnode_point(id: MachineId, vnode: u32) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(id.get().to_be_bytes());
    hasher.update(b":");
    hasher.update(vnode.to_be_bytes());
    let sum = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&sum[..8]);
    u64::from_be_bytes(buf)
}

/// Immutable vnode ring built from one shard list.
#[derive(Debug)]
pub struct ShardRing {
    points: BTreeMap<u64, MachineId>,
    entries: Vec<ShardEntry>,
}

impl ShardRing {
    pub fn build(entries: Vec<ShardEntry>) -> Self {
        let mut points = BTreeMap::new();
        for entry in &entries {
            for vnode in 0..VNODES_PER_SHARD {
                // collisions across 64-bit points are vanishingly rare and
                // deterministic either way (last writer in id order wins)
                points.insert(vnode_point(entry.id, vnode), entry.id);
            }
        }
        Self { points, entries }
    }

    pub fn entries(&self) -> &[ShardEntry] {
        &self.entries
    }

    fn is_available(&self, id: MachineId) -> bool {
        self.entries
            .iter()
            .any(|e| e.id == id && e.available)
    }

    /// Resolve the owner of `hash`: the first available shard clockwise
    /// from the hash's ring point.
    pub fn owner(&self, hash: &ContentHash) -> Result<MachineId> {
        if !self.entries.iter().any(|e| e.available) {
            return Err(TrackerError::no_shards());
        }
        let point = hash.prefix_u64();
        let walk = self
            .points
            .range(point..)
            .chain(self.points.range(..point));
        for (_, id) in walk {
            if self.is_available(*id) {
                return Ok(*id);
            }
        }
        Err(TrackerError::no_shards())
    }
}

/// Pure resolution against an ad-hoc shard list. The cached
/// [`ShardManager`] is the production path; this exists for callers (and
/// property tests) that carry their own list.
pub fn shard(hash: &ContentHash, entries: &[ShardEntry]) -> Result<MachineId> {
    ShardRing::build(entries.to_vec()).owner(hash)
}

/// Caches the ring and republishes the shard list on membership or
/// availability changes.
pub struct ShardManager {
    ring: RwLock<Arc<ShardRing>>,
    updates: watch::Sender<Vec<ShardEntry>>,
}

impl ShardManager {
    /// Build from the cell's current snapshot and track every subsequent
    /// shape change.
    pub fn new(cell: &ClusterStateCell) -> Arc<Self> {
        let entries = shard_list(&cell.current());
        let (updates, _) = watch::channel(entries.clone());
        let manager = Arc::new(Self {
            ring: RwLock::new(Arc::new(ShardRing::build(entries))),
            updates,
        });

        let tracked = manager.clone();
        cell.on_change(Box::new(move |state| tracked.rebuild(state)));
        manager
    }

    fn rebuild(&self, state: &ClusterState) {
        let entries = shard_list(state);
        debug!(shards = entries.len(), "rebuilding shard ring");
        *self.ring.write() = Arc::new(ShardRing::build(entries.clone()));
        let _ = self.updates.send(entries);
    }

    /// The ordered (machine id, available) list.
    pub fn entries(&self) -> Vec<ShardEntry> {
        self.ring.read().entries().to_vec()
    }

    /// Event stream firing on any membership or availability change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ShardEntry>> {
        self.updates.subscribe()
    }

    pub fn owner(&self, hash: &ContentHash) -> Result<MachineId> {
        let ring = self.ring.read().clone();
        ring.owner(hash)
    }
}
