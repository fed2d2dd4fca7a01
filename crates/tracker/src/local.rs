//! # Local Content Tracker
//!
//! In-memory per-hash store with idempotent merge semantics. This is the
//! bottom layer of the tracker stack: the distributed tracker merges
//! everything — its own mints, ring traffic, DHT responses — into one of
//! these, and readers always observe fully merged entries, never torn
//! ones.
//!
//! ## Locking
//!
//! Entries are striped by the hash prefix across `stripe_count` mutexes,
//! so contention is proportional to hot-hash overlap rather than total
//! hash count. Stamp minting takes the stripe lock across the
//! read-increment-merge sequence, which serializes mints per (hash, self)
//! and keeps sequence numbers strictly increasing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dclt_common::{Clock, Result, TrackerError};
use dclt_proto::{ChangeStamp, ContentEntry, ContentHash, MachineId, StampOperation};

use crate::api::{ContentTracker, LocationsFound, UpdateOutcome};

pub struct LocalContentTracker {
    self_id: MachineId,
    clock: Arc<dyn Clock>,
    stripes: Vec<Mutex<HashMap<ContentHash, ContentEntry>>>,
}

impl LocalContentTracker {
    pub fn new(self_id: MachineId, clock: Arc<dyn Clock>, stripe_count: usize) -> Self {
        let stripe_count = stripe_count.max(1);
        Self {
            self_id,
            clock,
            stripes: (0..stripe_count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn self_id(&self) -> MachineId {
        self.self_id
    }

    fn stripe(&self, hash: &ContentHash) -> &Mutex<HashMap<ContentHash, ContentEntry>> {
        let index = (hash.prefix_u64() % self.stripes.len() as u64) as usize;
        &self.stripes[index]
    }

    /// Merge each incoming entry into local state. Purely local, never
    /// fails; applying the same entries twice is a no-op.
    pub fn merge_entries(&self, entries: &[ContentEntry]) {
        for entry in entries {
            let mut stripe = self.stripe(&entry.hash()).lock();
            stripe
                .entry(entry.hash())
                .or_insert_with(|| ContentEntry::empty(entry.hash()))
                .merge_from(entry);
        }
    }

    /// One entry per requested hash, empty for hashes never seen. Each
    /// entry is cloned under its stripe lock, so it is a merged snapshot.
    pub fn entries_for(&self, hashes: &[ContentHash]) -> Vec<ContentEntry> {
        hashes
            .iter()
            .map(|hash| {
                self.stripe(hash)
                    .lock()
                    .get(hash)
                    .cloned()
                    .unwrap_or_else(|| ContentEntry::empty(*hash))
            })
            .collect()
    }

    /// Highest observed sequence for (hash, machine); 0 if none.
    pub fn sequence(&self, hash: &ContentHash, machine: MachineId) -> u64 {
        self.stripe(hash)
            .lock()
            .get(hash)
            .map_or(0, |e| e.sequence_for(machine))
    }

    /// Mint a stamped operation for a local content change and merge it.
    ///
    /// Returns the minted single-operation entry so the caller can forward
    /// it. The stripe lock is held across read-mint-merge: two concurrent
    /// local changes to the same hash always produce distinct, increasing
    /// sequence numbers.
    pub fn process_local_change(
        &self,
        operation: StampOperation,
        hash: ContentHash,
        size: i64,
    ) -> ContentEntry {
        let mut stripe = self.stripe(&hash).lock();
        let entry = stripe
            .entry(hash)
            .or_insert_with(|| ContentEntry::empty(hash));
        let sequence = entry.sequence_for(self.self_id) + 1;
        let stamp = ChangeStamp::new(sequence, self.clock.now(), operation);
        entry.apply(self.self_id, stamp, size);
        debug!(%hash, sequence, ?operation, "minted local change");
        ContentEntry::single(hash, size, self.self_id, stamp)
    }

    /// Drop entries whose surviving stamps are all tombstones older than
    /// `retention`. Returns how many entries were pruned.
    pub fn prune_tombstones(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let horizon = now - retention;
        let mut pruned = 0;
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            let before = stripe.len();
            stripe.retain(|_, entry| !entry.fully_tombstoned_before(horizon));
            pruned += before - stripe.len();
        }
        if pruned > 0 {
            debug!(pruned, "pruned tombstoned entries");
        }
        pruned
    }

    /// Number of tracked hashes across all stripes.
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.iter().all(|s| s.lock().is_empty())
    }
}

#[async_trait]
impl ContentTracker for LocalContentTracker {
    async fn update_locations(
        &self,
        entries: Vec<ContentEntry>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        if cancel.is_cancelled() {
            return Err(TrackerError::cancelled("update_locations"));
        }
        self.merge_entries(&entries);
        Ok(UpdateOutcome::default())
    }

    async fn get_locations(
        &self,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Result<LocationsFound> {
        if cancel.is_cancelled() {
            return Err(TrackerError::cancelled("get_locations"));
        }
        Ok(LocationsFound {
            entries: self.entries_for(hashes),
            warnings: Vec::new(),
        })
    }

    fn sequence_number(&self, hash: &ContentHash, machine: MachineId) -> u64 {
        self.sequence(hash, machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dclt_common::VirtualClock;
    use dclt_proto::StampOperation::{Add, Delete};

    fn make_tracker(id: u32) -> (LocalContentTracker, Arc<VirtualClock>) {
        let clock = VirtualClock::starting_now();
        (
            LocalContentTracker::new(MachineId::new(id), clock.clone(), 8),
            clock,
        )
    }

    fn h(tag: &[u8]) -> ContentHash {
        ContentHash::digest(tag)
    }

    #[test]
    fn test_sequence_starts_at_zero() {
        let (tracker, _) = make_tracker(1);
        assert_eq!(tracker.sequence(&h(b"x"), MachineId::new(1)), 0);
    }

    #[test]
    fn test_local_change_increments_sequence_by_one() {
        let (tracker, _) = make_tracker(1);
        let hash = h(b"x");
        for expected in 1..=5 {
            tracker.process_local_change(Add, hash, 100);
            assert_eq!(tracker.sequence(&hash, MachineId::new(1)), expected);
        }
    }

    #[test]
    fn test_minted_entry_carries_the_change() {
        let (tracker, _) = make_tracker(2);
        let hash = h(b"y");
        let minted = tracker.process_local_change(Add, hash, 4096);
        assert!(minted.contains(MachineId::new(2)));
        assert_eq!(minted.size(), 4096);
        assert_eq!(minted.sequence_for(MachineId::new(2)), 1);
    }

    #[test]
    fn test_delete_produces_tombstone() {
        let (tracker, _) = make_tracker(1);
        let hash = h(b"z");
        tracker.process_local_change(Add, hash, 10);
        tracker.process_local_change(Delete, hash, dclt_proto::SIZE_UNKNOWN);
        let entry = &tracker.entries_for(&[hash])[0];
        assert!(entry.tombstone(MachineId::new(1)));
        assert_eq!(entry.sequence_for(MachineId::new(1)), 2);
        // size observed before the delete is retained
        assert_eq!(entry.size(), 10);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (a, _) = make_tracker(1);
        let (b, _) = make_tracker(2);
        let hash = h(b"shared");
        let minted = a.process_local_change(Add, hash, 64);
        b.merge_entries(&[minted.clone()]);
        b.merge_entries(&[minted]);
        let entry = &b.entries_for(&[hash])[0];
        assert!(entry.contains(MachineId::new(1)));
        assert_eq!(entry.operations().count(), 1);
    }

    #[test]
    fn test_entries_for_missing_hash_is_empty() {
        let (tracker, _) = make_tracker(1);
        let entries = tracker.entries_for(&[h(b"absent")]);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_empty());
    }

    #[test]
    fn test_concurrent_mints_produce_distinct_sequences() {
        let clock = VirtualClock::starting_now();
        let tracker = Arc::new(LocalContentTracker::new(MachineId::new(1), clock, 4));
        let hash = h(b"hot");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.process_local_change(Add, hash, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.sequence(&hash, MachineId::new(1)), 400);
    }

    #[test]
    fn test_prune_drops_only_expired_tombstones() {
        let (tracker, clock) = make_tracker(1);
        let dead = h(b"dead");
        let live = h(b"live");
        tracker.process_local_change(Delete, dead, -1);
        clock.advance(Duration::hours(2));
        tracker.process_local_change(Add, live, 1);
        tracker.process_local_change(Delete, live, -1);

        let pruned = tracker.prune_tombstones(clock.now(), Duration::hours(1));
        assert_eq!(pruned, 1);
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.entries_for(&[live])[0].is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_yields_cancelled() {
        let (tracker, _) = make_tracker(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tracker
            .get_locations(&[h(b"x")], &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
