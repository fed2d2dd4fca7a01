//! # Cluster State Cell
//!
//! Copy-on-write holder for the current [`ClusterState`] plus the two
//! subscription surfaces:
//!
//! - synchronous callbacks, invoked on the updater's thread after any
//!   shape change (record added, state changed, location changed);
//! - a `watch` channel of snapshots for async consumers, published in the
//!   order the state machine accepted the mutations.
//!
//! Readers clone an `Arc` and never block writers. Callbacks must not call
//! back into the cell; they receive the fresh snapshot as an argument.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::state::ClusterState;

/// Synchronous shape-change subscriber.
pub type StateCallback = Box<dyn Fn(&ClusterState) + Send + Sync>;

pub struct ClusterStateCell {
    current: RwLock<Arc<ClusterState>>,
    snapshots: watch::Sender<Arc<ClusterState>>,
    callbacks: RwLock<Vec<StateCallback>>,
}

impl ClusterStateCell {
    pub fn new(initial: ClusterState) -> Arc<Self> {
        let initial = Arc::new(initial);
        let (snapshots, _) = watch::channel(initial.clone());
        Arc::new(Self {
            current: RwLock::new(initial),
            snapshots,
            callbacks: RwLock::new(Vec::new()),
        })
    }

    /// The snapshot as of now. Stays valid (and stale) for as long as the
    /// caller holds it.
    pub fn current(&self) -> Arc<ClusterState> {
        self.current.read().clone()
    }

    /// Async subscription; receivers observe every shape change in order.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.snapshots.subscribe()
    }

    /// Register a synchronous callback. Fired only for shape changes, not
    /// for pure heartbeat-time refreshes.
    pub fn on_change(&self, callback: StateCallback) {
        self.callbacks.write().push(callback);
    }

    /// Apply a pure mutation and publish the result.
    ///
    /// The write lock is held through notification so subscribers observe
    /// mutations in acceptance order.
    pub fn mutate<T>(&self, f: impl FnOnce(&ClusterState) -> (ClusterState, T)) -> T {
        let mut slot = self.current.write();
        let (next, out) = f(slot.as_ref());
        let shape_changed = !same_shape(slot.as_ref(), &next);
        let next = Arc::new(next);
        *slot = next.clone();

        if shape_changed {
            debug!(records = next.len(), "cluster shape changed");
            let _ = self.snapshots.send(next.clone());
            for callback in self.callbacks.read().iter() {
                callback(&next);
            }
        }
        out
    }
}

/// Shape = the (id, location, state) triples; heartbeat times are excluded
/// so periodic heartbeats do not wake every subscriber.
fn same_shape(a: &ClusterState, b: &ClusterState) -> bool {
    a.len() == b.len()
        && a.records()
            .zip(b.records())
            .all(|(x, y)| x.id == y.id && x.location == y.location && x.state == y.state)
}
