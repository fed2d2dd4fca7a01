//! # DCLT Tracker Crate
//!
//! The ephemeral content tracker proper: the striped in-memory local
//! tracker, the routing (distributed) tracker above it, the nagle batching
//! queue, the `Cache.ContentTracker` RPC transport and read-through
//! placement against the backing store.
//!
//! ```text
//!  content store callbacks        lookups
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────────────────────────────┐
//!   │          DistributedTracker         │──▶ EventBatcher ──▶ ring leader
//!   │   (routing + hop failure policy)    │──▶ shard owner (DHT)
//!   └────────────────┬────────────────────┘
//!                    ▼
//!          LocalContentTracker (striped, CRDT merges)
//! ```

pub mod api;
pub mod batcher;
pub mod bootstrap;
pub mod distributed;
pub mod local;
pub mod resolver;
pub mod transport;

pub use api::{
    ContentStoreListener, ContentTracker, LocationsFound, StubContentTracker, UpdateOutcome,
};
pub use batcher::{BatchSink, EventBatcher, FlushPause};
pub use bootstrap::{decode_batch, encode_batch, resolve_batch, BlobStore, LocationBatch};
pub use distributed::{DistributedTracker, RetryPolicy, RoutingView};
pub use local::LocalContentTracker;
pub use resolver::{BackingStore, Placement, PlacementResolver};
pub use transport::{LocationClient, TcpLocationClient, TrackerServer, TrackerService};
