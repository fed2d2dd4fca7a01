//! # Tracker Capability Surface
//!
//! The small capability set every content tracker variant implements:
//! update, get, sequence number. The distributed tracker owns a local
//! tracker and a transport client and is composed through these traits
//! rather than inheritance; a stub exists for hosts that run without any
//! location tracking.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dclt_common::Result;
use dclt_proto::{ContentEntry, ContentHash, MachineId};

/// Result of a lookup: entries parallel to the requested hashes, plus
/// partial-data diagnostics from hops that could not contribute.
#[derive(Debug, Clone, Default)]
pub struct LocationsFound {
    pub entries: Vec<ContentEntry>,
    pub warnings: Vec<String>,
}

impl LocationsFound {
    /// The merged entry for `hash`, if it was part of the request.
    pub fn entry_for(&self, hash: &ContentHash) -> Option<&ContentEntry> {
        self.entries.iter().find(|e| e.hash() == *hash)
    }

    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Outcome of an update: the operation succeeded, possibly with hops that
/// will be repaired lazily.
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub warnings: Vec<String>,
}

/// Capability set shared by the local, distributed and stub trackers.
#[async_trait]
pub trait ContentTracker: Send + Sync {
    /// Merge the given entries into this tracker's view.
    async fn update_locations(
        &self,
        entries: Vec<ContentEntry>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome>;

    /// Resolve the current view for each hash; missing hashes yield empty
    /// entries.
    async fn get_locations(
        &self,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Result<LocationsFound>;

    /// Highest sequence number observed for (hash, machine); 0 if none.
    fn sequence_number(&self, hash: &ContentHash, machine: MachineId) -> u64;
}

/// Hook the local content store drives on add/delete. The distributed
/// tracker implements this and turns each callback into a stamped local
/// change.
#[async_trait]
pub trait ContentStoreListener: Send + Sync {
    async fn on_content_added(&self, hash: ContentHash, size: i64) -> Result<UpdateOutcome>;
    async fn on_content_deleted(&self, hash: ContentHash) -> Result<UpdateOutcome>;
}

/// Tracker that tracks nothing. Lookups come back empty and updates are
/// accepted and dropped.
#[derive(Debug, Default, Clone)]
pub struct StubContentTracker;

#[async_trait]
impl ContentTracker for StubContentTracker {
    async fn update_locations(
        &self,
        _entries: Vec<ContentEntry>,
        _cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        Ok(UpdateOutcome::default())
    }

    async fn get_locations(
        &self,
        hashes: &[ContentHash],
        _cancel: &CancellationToken,
    ) -> Result<LocationsFound> {
        Ok(LocationsFound {
            entries: hashes.iter().map(|h| ContentEntry::empty(*h)).collect(),
            warnings: Vec::new(),
        })
    }

    fn sequence_number(&self, _hash: &ContentHash, _machine: MachineId) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_returns_empty_entries_parallel_to_request() {
        let stub = StubContentTracker;
        let hashes = [ContentHash::digest(b"a"), ContentHash::digest(b"b")];
        let found = stub
            .get_locations(&hashes, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.entries.len(), 2);
        assert!(found.entries.iter().all(ContentEntry::is_empty));
        assert_eq!(found.entries[0].hash(), hashes[0]);
    }
}
