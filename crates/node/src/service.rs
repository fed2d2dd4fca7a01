//! # Tracker Node Service
//!
//! Wires the cluster cell, shard manager, trackers and RPC server into one
//! startable unit. `start` brings components up bottom-to-top (register in
//! the cluster, bind the endpoint, spawn the periodic tasks); `stop`
//! releases them in reverse order. There is no global process state — a
//! test can run several nodes in one process.
//!
//! Periodic work:
//! - heartbeat into the cluster state every `heartbeat_interval`;
//! - liveness sweep (`transition_inactive`) on the same cadence;
//! - tombstone retention pruning at a quarter of `tombstone_retention`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dclt_cluster::{ClusterState, ClusterStateCell, LivenessConfig, ShardManager};
use dclt_common::{Clock, Result, TrackerConfig, TrackerError};
use dclt_proto::{MachineId, MachineLocation, MachineState};
use dclt_tracker::{
    DistributedTracker, LocalContentTracker, RoutingView, TcpLocationClient, TrackerServer,
};

pub struct TrackerNode {
    cfg: TrackerConfig,
    liveness: LivenessConfig,
    clock: Arc<dyn Clock>,
    advertised: MachineLocation,
    cell: Arc<ClusterStateCell>,
    self_id: Option<MachineId>,
    tracker: Option<Arc<DistributedTracker>>,
    server: Option<TrackerServer>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl TrackerNode {
    pub fn new(cfg: TrackerConfig, advertised: MachineLocation, clock: Arc<dyn Clock>) -> Self {
        let liveness = LivenessConfig::from_tracker_config(&cfg);
        Self {
            cfg,
            liveness,
            clock,
            advertised,
            cell: ClusterStateCell::new(ClusterState::new()),
            self_id: None,
            tracker: None,
            server: None,
            tasks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// The cluster cell; the host's orchestrator feeds peer registrations
    /// and ring assignments through it.
    pub fn cell(&self) -> &Arc<ClusterStateCell> {
        &self.cell
    }

    /// Available after `start`.
    pub fn tracker(&self) -> Option<Arc<DistributedTracker>> {
        self.tracker.clone()
    }

    pub fn self_id(&self) -> Option<MachineId> {
        self.self_id
    }

    /// Register in the cluster, bind the RPC endpoint and spawn the
    /// periodic tasks.
    pub async fn start(&mut self) -> Result<()> {
        if self.tracker.is_some() {
            return Err(TrackerError::permanent("node already started"));
        }

        let self_id = self.cell.mutate(|s| {
            s.register_machine(&self.liveness, &self.advertised, self.clock.now())
        });
        info!(%self_id, location = %self.advertised, "registered in cluster");
        self.self_id = Some(self_id);

        let local = Arc::new(LocalContentTracker::new(
            self_id,
            self.clock.clone(),
            self.cfg.stripe_count,
        ));
        let shards = ShardManager::new(&self.cell);
        let routing = RoutingView::new(self_id, self.cell.clone(), shards);
        let client = Arc::new(TcpLocationClient::new(self.cfg.rpc_timeout()));
        let tracker = DistributedTracker::new(local, client, routing, &self.cfg);

        let server = TrackerServer::bind(&self.cfg.bind_addr, tracker.clone()).await?;
        info!(addr = %server.local_addr(), "tracker endpoint up");

        self.spawn_heartbeat(self_id);
        self.spawn_liveness_sweep();
        self.spawn_tombstone_pruning(tracker.clone());

        self.server = Some(server);
        self.tracker = Some(tracker);
        Ok(())
    }

    /// Tear everything down in reverse start order: periodic tasks, the
    /// endpoint, then the tracker and its queue.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
        }
        info!("tracker node stopped");
    }

    fn spawn_heartbeat(&mut self, self_id: MachineId) {
        let cell = self.cell.clone();
        let clock = self.clock.clone();
        let location = self.advertised.clone();
        let interval = Duration::from_secs(self.cfg.heartbeat_interval);
        let shutdown = self.shutdown.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let outcome = cell.mutate(|s| {
                    match s.heartbeat(self_id, &location, clock.now(), MachineState::Open) {
                        Ok((next, prev)) => (next, Ok(prev)),
                        Err(e) => (s.clone(), Err(e)),
                    }
                });
                match outcome {
                    Ok(prev) if prev.is_dead() => {
                        warn!(%self_id, ?prev, "revived from a dead state");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // our id was reclaimed while we were away; this
                        // identity is gone and must not keep beating
                        error!(%self_id, error = %e, "heartbeat rejected, stopping");
                        return;
                    }
                }
            }
        }));
    }

    fn spawn_liveness_sweep(&mut self) {
        let cell = self.cell.clone();
        let clock = self.clock.clone();
        let liveness = self.liveness;
        let interval = Duration::from_secs(self.cfg.heartbeat_interval);
        let shutdown = self.shutdown.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                cell.mutate(|s| (s.transition_inactive(&liveness, clock.now()), ()));
            }
        }));
    }

    fn spawn_tombstone_pruning(&mut self, tracker: Arc<DistributedTracker>) {
        let clock = self.clock.clone();
        let retention = self.cfg.tombstone_retention();
        let interval = Duration::from_secs((self.cfg.tombstone_retention / 4).max(1));
        let shutdown = self.shutdown.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                tracker.local().prune_tombstones(clock.now(), retention);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dclt_common::SystemClock;
    use dclt_proto::{ContentHash, StampOperation};
    use dclt_tracker::ContentTracker;

    fn make_node() -> TrackerNode {
        let cfg = TrackerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..TrackerConfig::default()
        };
        let advertised = MachineLocation::parse("127.0.0.1:7070").unwrap();
        TrackerNode::new(cfg, advertised, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_start_registers_and_serves() {
        let mut node = make_node();
        node.start().await.expect("start");
        let self_id = node.self_id().expect("id");
        assert!(node.cell().current().record(self_id).is_some());

        let tracker = node.tracker().expect("tracker");
        let hash = ContentHash::digest(b"local");
        tracker
            .process_local_change(
                StampOperation::Add,
                hash,
                42,
                &CancellationToken::new(),
            )
            .await
            .expect("add");
        assert_eq!(tracker.sequence_number(&hash, self_id), 1);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut node = make_node();
        node.start().await.expect("start");
        assert!(node.start().await.is_err());
        node.stop().await;
    }
}
