//! # Distributed Content Tracker
//!
//! Routing layer above the local tracker. Updates flow worker → ring
//! leader → DHT shard owner; lookups walk the same path in reverse and
//! merge whatever each hop contributes. The DHT owner is the authoritative
//! index for its hashes; ring members hold cached views populated by
//! read-through, and the leader deliberately does NOT broadcast changes to
//! its workers.
//!
//! ## Hop failure policy
//!
//! | Failure | Handling |
//! |---------|----------|
//! | `Transient` | retried with exponential backoff, capped by `max_remote_wait` |
//! | `PermanentRejected`, `NoShards` | recorded; surfaced if no hop contributed |
//! | unreachable peer | empty contribution, never aborts a partly served lookup |
//! | `Cancelled` | surfaced immediately, distinct from failure |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dclt_cluster::{ClusterStateCell, Ring, RingSet, ShardManager};
use dclt_common::{Result, TrackerConfig, TrackerError};
use dclt_proto::{ContentEntry, ContentHash, MachineId, MachineLocation, StampOperation};

use crate::api::{ContentStoreListener, ContentTracker, LocationsFound, UpdateOutcome};
use crate::batcher::{BatchSink, EventBatcher};
use crate::local::LocalContentTracker;
use crate::transport::{LocationClient, TrackerService};

/// How many reachable locations make a lookup "sufficient" before the
/// remote hops are consulted.
pub const DEFAULT_SUFFICIENT_LOCATIONS: usize = 1;

// ════════════════════════════════════════════════════════════════════════════
// RETRY POLICY
// ════════════════════════════════════════════════════════════════════════════

/// Exponential backoff bounds for transient hop failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_total: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &TrackerConfig) -> Self {
        Self {
            attempts: cfg.retry_attempts.max(1),
            base_delay: Duration::from_millis(100),
            max_total: cfg.max_remote_wait(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_total: Duration::from_secs(30),
        }
    }
}

/// Run `op`, retrying transient failures with jittered exponential backoff
/// until the attempt or total-wait budget runs out.
async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = tokio::time::Instant::now();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.attempts || started.elapsed() >= policy.max_total {
                    return Err(e);
                }
                let exp = policy.base_delay * 2u32.saturating_pow(attempt - 1);
                let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
                let backoff = (exp + Duration::from_millis(jitter))
                    .min(policy.max_total.saturating_sub(started.elapsed()));
                debug!(what, attempt, ?backoff, "retrying after transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(TrackerError::cancelled(what.to_string()));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ROUTING VIEW
// ════════════════════════════════════════════════════════════════════════════

/// Everything the distributed tracker needs to know about the topology:
/// who it is, where peers live, who leads its ring and which shard owns a
/// hash.
pub struct RoutingView {
    self_id: MachineId,
    cell: Arc<ClusterStateCell>,
    shards: Arc<ShardManager>,
    rings: RwLock<RingSet>,
}

impl RoutingView {
    pub fn new(
        self_id: MachineId,
        cell: Arc<ClusterStateCell>,
        shards: Arc<ShardManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            cell,
            shards,
            rings: RwLock::new(RingSet::new()),
        })
    }

    pub fn self_id(&self) -> MachineId {
        self.self_id
    }

    pub fn location_of(&self, id: MachineId) -> Option<MachineLocation> {
        self.cell.current().location_of(id).cloned()
    }

    pub fn is_available(&self, id: MachineId) -> bool {
        self.cell.current().is_available(id)
    }

    /// Leader of the ring this machine belongs to, if it is in one.
    pub fn ring_leader(&self) -> Option<MachineId> {
        self.rings.read().leader_of(self.self_id)
    }

    pub fn is_ring_leader(&self) -> bool {
        self.ring_leader() == Some(self.self_id)
    }

    /// The DHT shard responsible for `hash`.
    pub fn shard_owner(&self, hash: &ContentHash) -> Result<MachineId> {
        self.shards.owner(hash)
    }

    pub fn add_ring(&self, ring: Ring) -> Result<()> {
        self.rings.write().add_ring(ring)
    }

    /// Tear down a ring: drop it from the set and mark every member
    /// DeadUnavailable in the cluster state. The resulting snapshot
    /// broadcast reroutes their shards.
    pub fn remove_ring(&self, id: &str) -> Option<Vec<MachineId>> {
        let ring = self.rings.write().remove_ring(id)?;
        let members = ring.builders().to_vec();
        self.cell.mutate(|s| (s.mark_unavailable(&members), ()));
        Some(members)
    }

    pub fn remove_machine_from_ring(&self, id: MachineId) {
        self.rings.write().remove_machine(id);
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FORWARDING
// ════════════════════════════════════════════════════════════════════════════

/// Push entries to their DHT owners, grouped per owner. Unreachable owners
/// become warnings: the authoritative index catches up through the next
/// read-through or reconciliation pass.
async fn forward_to_owners(
    routing: &RoutingView,
    client: &dyn LocationClient,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    entries: Vec<ContentEntry>,
) -> Result<Vec<String>> {
    let mut per_owner: BTreeMap<MachineId, Vec<ContentEntry>> = BTreeMap::new();
    let mut warnings = Vec::new();

    for entry in entries {
        match routing.shard_owner(&entry.hash()) {
            Ok(owner) if owner == routing.self_id() => {} // already merged locally
            Ok(owner) => per_owner.entry(owner).or_default().push(entry),
            Err(e) => warnings.push(format!("no shard for {}: {e}", entry.hash())),
        }
    }

    for (owner, batch) in per_owner {
        let Some(location) = routing.location_of(owner) else {
            warnings.push(format!("shard owner {owner} has no location"));
            continue;
        };
        let outcome = with_retry(retry, cancel, "forward to shard owner", || {
            client.update_locations(&location, batch.clone(), cancel)
        })
        .await;
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(owner = %owner, error = %e, "shard forward failed");
                warnings.push(format!("forward to {owner}: {e}"));
            }
        }
    }
    Ok(warnings)
}

/// Batch sink for the worker → leader hop. If the machine turns out to be
/// leaderless (or the leader itself) at flush time, entries go straight to
/// their shard owners instead.
struct LeaderForwardSink {
    routing: Arc<RoutingView>,
    client: Arc<dyn LocationClient>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

#[async_trait]
impl BatchSink for LeaderForwardSink {
    async fn flush(&self, batch: Vec<ContentEntry>) -> Result<()> {
        match self.routing.ring_leader() {
            Some(leader) if leader != self.routing.self_id() => {
                let location = self
                    .routing
                    .location_of(leader)
                    .ok_or_else(|| TrackerError::unknown_machine(leader.get()))?;
                with_retry(&self.retry, &self.shutdown, "send batch to leader", || {
                    self.client
                        .update_locations(&location, batch.clone(), &self.shutdown)
                })
                .await
            }
            _ => {
                let warnings = forward_to_owners(
                    &self.routing,
                    self.client.as_ref(),
                    &self.retry,
                    &self.shutdown,
                    batch,
                )
                .await?;
                for warning in warnings {
                    warn!(%warning, "leaderless batch flush");
                }
                Ok(())
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DISTRIBUTED TRACKER
// ════════════════════════════════════════════════════════════════════════════

/// The routing tracker: owns a [`LocalContentTracker`], a transport client
/// and the batching queue, and implements both the caller-facing
/// [`ContentTracker`] capability and the server-facing [`TrackerService`].
pub struct DistributedTracker {
    local: Arc<LocalContentTracker>,
    client: Arc<dyn LocationClient>,
    routing: Arc<RoutingView>,
    batcher: Arc<EventBatcher>,
    retry: RetryPolicy,
    sufficiency: usize,
    shutdown: CancellationToken,
}

impl DistributedTracker {
    pub fn new(
        local: Arc<LocalContentTracker>,
        client: Arc<dyn LocationClient>,
        routing: Arc<RoutingView>,
        cfg: &TrackerConfig,
    ) -> Arc<Self> {
        let retry = RetryPolicy::from_config(cfg);
        let shutdown = CancellationToken::new();
        let sink = Arc::new(LeaderForwardSink {
            routing: routing.clone(),
            client: client.clone(),
            retry,
            shutdown: shutdown.clone(),
        });
        let batcher = EventBatcher::spawn(sink, cfg.event_batch_size, cfg.nagle_interval());
        Arc::new(Self {
            local,
            client,
            routing,
            batcher,
            retry,
            sufficiency: DEFAULT_SUFFICIENT_LOCATIONS,
            shutdown,
        })
    }

    pub fn local(&self) -> &Arc<LocalContentTracker> {
        &self.local
    }

    pub fn routing(&self) -> &Arc<RoutingView> {
        &self.routing
    }

    pub fn batcher(&self) -> &Arc<EventBatcher> {
        &self.batcher
    }

    /// Token cancelled on `stop`; pending operations resolve as Cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background work. Monotonic merges make partially propagated
    /// state safe to leave behind.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.batcher.shutdown();
    }

    /// Mint a stamp for a local content change, merge it locally and start
    /// it on the update path (batched to the ring leader, or straight to
    /// the shard owner when this machine leads or has no ring).
    pub async fn process_local_change(
        &self,
        operation: StampOperation,
        hash: ContentHash,
        size: i64,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        if cancel.is_cancelled() {
            return Err(TrackerError::cancelled("process_local_change"));
        }
        let minted = self.local.process_local_change(operation, hash, size);

        match self.routing.ring_leader() {
            Some(leader) if leader != self.routing.self_id() => {
                self.batcher.offer(minted).await;
                Ok(UpdateOutcome::default())
            }
            _ => {
                let warnings = forward_to_owners(
                    &self.routing,
                    self.client.as_ref(),
                    &self.retry,
                    cancel,
                    vec![minted],
                )
                .await?;
                Ok(UpdateOutcome { warnings })
            }
        }
    }

    fn sufficient(&self, entry: &ContentEntry) -> bool {
        entry
            .locations()
            .into_iter()
            .filter(|m| self.routing.is_available(*m))
            .count()
            >= self.sufficiency
    }

    /// Query one peer for the given hashes and read-through cache whatever
    /// comes back.
    async fn query_peer(
        &self,
        peer: MachineId,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentEntry>> {
        let location = self
            .routing
            .location_of(peer)
            .ok_or_else(|| TrackerError::unknown_machine(peer.get()))?;
        let entries = with_retry(&self.retry, cancel, "get_locations from peer", || {
            self.client.get_locations(&location, hashes, cancel)
        })
        .await?;
        let non_empty: Vec<ContentEntry> =
            entries.iter().filter(|e| !e.is_empty()).cloned().collect();
        self.local.merge_entries(&non_empty);
        Ok(entries)
    }

    /// Merge a remote response into the working set, matching by hash.
    fn absorb(results: &mut [ContentEntry], remote: Vec<ContentEntry>) {
        for incoming in remote {
            if let Some(slot) = results.iter_mut().find(|e| e.hash() == incoming.hash()) {
                slot.merge_from(&incoming);
            }
        }
    }

    fn aggregate_failure(hop_errors: Vec<TrackerError>, warnings: &[String]) -> TrackerError {
        let first = hop_errors
            .iter()
            .position(|e| !e.is_transient())
            .unwrap_or(0);
        let error = &hop_errors[first];
        TrackerError::new(
            error.kind(),
            format!("{}; hops: [{}]", error.diagnostic(), warnings.join("; ")),
        )
    }
}

#[async_trait]
impl ContentTracker for DistributedTracker {
    async fn update_locations(
        &self,
        entries: Vec<ContentEntry>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        if cancel.is_cancelled() {
            return Err(TrackerError::cancelled("update_locations"));
        }
        self.local.merge_entries(&entries);
        // Only a ring leader relays further; the DHT owner is the end of
        // the line, and workers receiving a forward store it silently.
        if self.routing.is_ring_leader() {
            let warnings = forward_to_owners(
                &self.routing,
                self.client.as_ref(),
                &self.retry,
                cancel,
                entries,
            )
            .await?;
            return Ok(UpdateOutcome { warnings });
        }
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

        let mut results = self.local.entries_for(hashes);
        let mut warnings: Vec<String> = Vec::new();
        let mut hop_errors: Vec<TrackerError> = Vec::new();

        // hop 2: ring leader, for hashes the local view cannot satisfy
        let wanting: Vec<ContentHash> = results
            .iter()
            .filter(|e| !self.sufficient(e))
            .map(|e| e.hash())
            .collect();
        if !wanting.is_empty() {
            if let Some(leader) = self
                .routing
                .ring_leader()
                .filter(|l| *l != self.routing.self_id())
            {
                match self.query_peer(leader, &wanting, cancel).await {
                    Ok(remote) => Self::absorb(&mut results, remote),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warnings.push(format!("leader {leader}: {e}"));
                        hop_errors.push(e);
                    }
                }
            }
        }

        // hop 3: authoritative shard owners, grouped per owner
        let mut per_owner: BTreeMap<MachineId, Vec<ContentHash>> = BTreeMap::new();
        for entry in results.iter().filter(|e| !self.sufficient(e)) {
            match self.routing.shard_owner(&entry.hash()) {
                Ok(owner) if owner == self.routing.self_id() => {}
                Ok(owner) => per_owner.entry(owner).or_default().push(entry.hash()),
                Err(e) => {
                    warnings.push(format!("no shard for {}: {e}", entry.hash()));
                    hop_errors.push(e);
                }
            }
        }
        for (owner, owner_hashes) in per_owner {
            match self.query_peer(owner, &owner_hashes, cancel).await {
                Ok(remote) => Self::absorb(&mut results, remote),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warnings.push(format!("shard owner {owner}: {e}"));
                    hop_errors.push(e);
                }
            }
        }

        let any_data = results.iter().any(|e| !e.is_empty());
        if !any_data && !hop_errors.is_empty() {
            return Err(Self::aggregate_failure(hop_errors, &warnings));
        }
        Ok(LocationsFound {
            entries: results,
            warnings,
        })
    }

    fn sequence_number(&self, hash: &ContentHash, machine: MachineId) -> u64 {
        self.local.sequence(hash, machine)
    }
}

#[async_trait]
impl TrackerService for DistributedTracker {
    async fn handle_update(&self, entries: Vec<ContentEntry>) -> Result<()> {
        self.local.merge_entries(&entries);
        if self.routing.is_ring_leader() {
            let warnings = forward_to_owners(
                &self.routing,
                self.client.as_ref(),
                &self.retry,
                &self.shutdown,
                entries,
            )
            .await?;
            for warning in warnings {
                warn!(%warning, "relay from ring");
            }
        }
        Ok(())
    }

    async fn handle_get(&self, hashes: Vec<ContentHash>) -> Result<Vec<ContentEntry>> {
        Ok(self.local.entries_for(&hashes))
    }
}

#[async_trait]
impl ContentStoreListener for DistributedTracker {
    async fn on_content_added(&self, hash: ContentHash, size: i64) -> Result<UpdateOutcome> {
        self.process_local_change(StampOperation::Add, hash, size, &self.shutdown)
            .await
    }

    async fn on_content_deleted(&self, hash: ContentHash) -> Result<UpdateOutcome> {
        self.process_local_change(
            StampOperation::Delete,
            hash,
            dclt_proto::SIZE_UNKNOWN,
            &self.shutdown,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_retry_gives_up_on_permanent() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: Result<()> = with_retry(&policy, &cancel, "op", || {
            calls += 1;
            async { Err(TrackerError::permanent("refused")) }
        })
        .await;
        assert_eq!(calls, 1);
        assert_eq!(
            result.unwrap_err().kind(),
            dclt_common::ErrorKind::PermanentRejected
        );
    }

    #[tokio::test]
    async fn test_with_retry_retries_transient_until_budget() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_total: Duration::from_secs(5),
        };
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: Result<()> = with_retry(&policy, &cancel, "op", || {
            calls += 1;
            async { Err(TrackerError::transient("flaky")) }
        })
        .await;
        assert_eq!(calls, 3);
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_mid_sequence() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
            max_total: Duration::from_secs(5),
        };
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result = with_retry(&policy, &cancel, "op", || {
            calls += 1;
            let outcome = if calls < 3 {
                Err(TrackerError::transient("flaky"))
            } else {
                Ok(calls)
            };
            async move { outcome }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
