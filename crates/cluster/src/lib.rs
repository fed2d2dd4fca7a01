//! # DCLT Cluster Crate
//!
//! Cluster membership for the distributed content tracker: the pure state
//! machine that assigns machine ids and drives liveness, the copy-on-write
//! cell that publishes snapshots, the shard manager mapping hashes to
//! responsible machines, and per-build ring coordination.
//!
//! ```text
//! heartbeats / registrations
//!            │
//!            ▼
//!   ┌─────────────────┐   snapshots    ┌───────────────┐
//!   │ ClusterStateCell│ ──────────────▶│ ShardManager  │──▶ owner(hash)
//!   │  (ClusterState) │   callbacks    └───────────────┘
//!   └─────────────────┘
//!            │
//!            ▼
//!        RingSet (build rings, leader per ring)
//! ```

pub mod cell;
pub mod ring;
pub mod shard;
pub mod state;

pub use cell::{ClusterStateCell, StateCallback};
pub use ring::{Ring, RingSet};
pub use shard::{shard, shard_list, ShardEntry, ShardManager, ShardRing, VNODES_PER_SHARD};
pub use state::{ClusterState, LivenessConfig};
