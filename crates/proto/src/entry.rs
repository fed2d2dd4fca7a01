//! # Content Entries
//!
//! The merged per-hash record: for every machine that has ever reported the
//! hash, the single surviving stamped operation. Entries form a state-based
//! CRDT — `merge` is idempotent, commutative and associative — so replicas
//! converge regardless of delivery order or duplication.
//!
//! ## Invariants
//!
//! - At most one surviving stamp per machine; older stamps are evicted on
//!   merge.
//! - `size` is the largest non-negative size observed; −1 means unknown.
//! - The operations map is bounded by the number of machines that ever
//!   touched the hash, which is bounded by active cluster size.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::machine::MachineId;
use crate::stamp::{ChangeStamp, StampOperation, Stamped};

/// Size marker for "not yet observed".
pub const SIZE_UNKNOWN: i64 = -1;

/// 32-byte content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Digest arbitrary content. Used by the harness and by callers that
    /// address content by its bytes.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Stable stripe selector: first 8 bytes as big-endian u64.
    pub fn prefix_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Merged per-hash location record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    hash: ContentHash,
    size: i64,
    operations: BTreeMap<MachineId, ChangeStamp>,
}

impl ContentEntry {
    /// Empty entry: no operations, unknown size.
    pub fn empty(hash: ContentHash) -> Self {
        Self {
            hash,
            size: SIZE_UNKNOWN,
            operations: BTreeMap::new(),
        }
    }

    /// Entry carrying exactly one freshly minted operation.
    pub fn single(hash: ContentHash, size: i64, machine: MachineId, stamp: ChangeStamp) -> Self {
        let mut operations = BTreeMap::new();
        operations.insert(machine, stamp);
        Self {
            hash,
            size: size.max(SIZE_UNKNOWN),
            operations,
        }
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// True when no machine has ever reported this hash.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The machine's surviving operation is an Add.
    pub fn contains(&self, machine: MachineId) -> bool {
        self.operations
            .get(&machine)
            .is_some_and(|s| !s.is_tombstone())
    }

    /// The machine's surviving operation is a Delete.
    pub fn tombstone(&self, machine: MachineId) -> bool {
        self.operations
            .get(&machine)
            .is_some_and(ChangeStamp::is_tombstone)
    }

    /// Machines whose surviving operation is an Add, in id order.
    pub fn locations(&self) -> Vec<MachineId> {
        self.operations
            .iter()
            .filter(|(_, s)| !s.is_tombstone())
            .map(|(m, _)| *m)
            .collect()
    }

    /// Highest sequence number this entry has observed for `machine`,
    /// 0 if the machine never touched the hash.
    pub fn sequence_for(&self, machine: MachineId) -> u64 {
        self.operations.get(&machine).map_or(0, |s| s.sequence)
    }

    pub fn stamp_for(&self, machine: MachineId) -> Option<&ChangeStamp> {
        self.operations.get(&machine)
    }

    /// Surviving stamped operations, one per machine, in id order.
    pub fn operations(&self) -> impl Iterator<Item = Stamped<MachineId>> + '_ {
        self.operations
            .iter()
            .map(|(m, s)| Stamped::new(*s, *m))
    }

    /// True when every surviving stamp is a tombstone older than `horizon`.
    /// Such entries are eligible for retention pruning.
    pub fn fully_tombstoned_before(&self, horizon: chrono::DateTime<chrono::Utc>) -> bool {
        !self.operations.is_empty()
            && self
                .operations
                .values()
                .all(|s| s.is_tombstone() && s.timestamp < horizon)
    }

    /// Merge `other` into `self`. Both entries must describe the same hash.
    ///
    /// Per machine the greater stamp under (seq, ts, op-rank) survives;
    /// size keeps the largest non-negative observation.
    pub fn merge_from(&mut self, other: &ContentEntry) {
        debug_assert_eq!(self.hash, other.hash, "merging entries for different hashes");
        if other.size > self.size {
            self.size = other.size;
        }
        for (machine, stamp) in &other.operations {
            match self.operations.get(machine) {
                Some(existing) if *existing >= *stamp => {}
                _ => {
                    self.operations.insert(*machine, *stamp);
                }
            }
        }
    }

    /// Pure merge of two entries for the same hash.
    pub fn merged(mut a: ContentEntry, b: &ContentEntry) -> ContentEntry {
        a.merge_from(b);
        a
    }

    /// Record a single stamped operation, keeping the merge invariant.
    pub fn apply(&mut self, machine: MachineId, stamp: ChangeStamp, size: i64) {
        let single = ContentEntry::single(self.hash, size, machine, stamp);
        self.merge_from(&single);
    }
}
