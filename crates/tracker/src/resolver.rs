//! # Placement Resolution
//!
//! Decides where a piece of content should be fetched from: a live peer
//! named by the tracker, or the backing persistent cache as a read-through
//! fallback (e.g. after the ring that produced the content was torn down).
//! The tracker only ever knows a boolean "might exist in the backing
//! store" until the store itself answers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dclt_common::Result;
use dclt_proto::{ContentHash, MachineId, MachineLocation};

use crate::api::ContentTracker;
use crate::distributed::RoutingView;

/// The backing persistent cache, as the tracker sees it.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Cheap, possibly stale hint.
    fn might_exist(&self, hash: &ContentHash) -> bool;

    /// Authoritative answer from the store itself.
    async fn confirm(&self, hash: &ContentHash) -> Result<bool>;
}

/// Where a `place_file` call should source the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// A live machine advertises the content.
    Peer {
        machine: MachineId,
        location: MachineLocation,
    },
    /// No live copy in the datacenter; fall back to the backing store.
    BackingStore,
    NotFound,
}

/// Read-through placement over the tracker plus the backing store.
pub struct PlacementResolver {
    tracker: Arc<dyn ContentTracker>,
    routing: Arc<RoutingView>,
    backing: Arc<dyn BackingStore>,
}

impl PlacementResolver {
    pub fn new(
        tracker: Arc<dyn ContentTracker>,
        routing: Arc<RoutingView>,
        backing: Arc<dyn BackingStore>,
    ) -> Self {
        Self {
            tracker,
            routing,
            backing,
        }
    }

    /// Resolve a source for `hash`. Peers are only offered while their
    /// machine is still available in the cluster state; entries pointing
    /// exclusively at dead machines fall through to the backing store.
    pub async fn place_file(
        &self,
        hash: ContentHash,
        cancel: &CancellationToken,
    ) -> Result<Placement> {
        let found = self.tracker.get_locations(&[hash], cancel).await?;
        if let Some(entry) = found.entry_for(&hash) {
            for machine in entry.locations() {
                if !self.routing.is_available(machine) {
                    continue;
                }
                if let Some(location) = self.routing.location_of(machine) {
                    debug!(%hash, %machine, "placing from peer");
                    return Ok(Placement::Peer { machine, location });
                }
            }
        }

        if self.backing.might_exist(&hash) && self.backing.confirm(&hash).await? {
            debug!(%hash, "placing from backing store");
            return Ok(Placement::BackingStore);
        }
        Ok(Placement::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StubContentTracker;

    use dclt_cluster::{ClusterState, ClusterStateCell, ShardManager};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    pub struct FixedBackingStore {
        known: Mutex<HashSet<ContentHash>>,
    }

    impl FixedBackingStore {
        fn with(hashes: &[ContentHash]) -> Arc<Self> {
            Arc::new(Self {
                known: Mutex::new(hashes.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl BackingStore for FixedBackingStore {
        fn might_exist(&self, _hash: &ContentHash) -> bool {
            true
        }

        async fn confirm(&self, hash: &ContentHash) -> Result<bool> {
            Ok(self.known.lock().contains(hash))
        }
    }

    fn make_routing() -> Arc<RoutingView> {
        let cell = ClusterStateCell::new(ClusterState::new());
        let shards = ShardManager::new(&cell);
        RoutingView::new(MachineId::new(1), cell, shards)
    }

    #[tokio::test]
    async fn test_unknown_content_with_backing_copy_places_from_store() {
        let hash = ContentHash::digest(b"archived");
        let resolver = PlacementResolver::new(
            Arc::new(StubContentTracker),
            make_routing(),
            FixedBackingStore::with(&[hash]),
        );
        let placement = resolver
            .place_file(hash, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(placement, Placement::BackingStore);
    }

    #[tokio::test]
    async fn test_unknown_content_without_backing_copy_is_not_found() {
        let resolver = PlacementResolver::new(
            Arc::new(StubContentTracker),
            make_routing(),
            FixedBackingStore::with(&[]),
        );
        let placement = resolver
            .place_file(ContentHash::digest(b"gone"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(placement, Placement::NotFound);
    }
}
