//! # DCLT Proto Crate
//!
//! Official data contracts for the distributed content tracker. Everything
//! that crosses a machine boundary — change stamps, content entries,
//! machine records, RPC envelopes — is defined here, and nothing here
//! performs I/O.
//!
//! ## Modules
//!
//! - [`stamp`]: change stamps and the causal ordering
//! - [`entry`]: content hashes and the merged per-hash entry (CRDT merge)
//! - [`machine`]: machine ids, locations, states, records (JSON contract)
//! - [`wire`]: field-tagged RPC messages and domain conversions
//! - [`framing`]: length-prefixed frame codec
//! - [`error`]: wire-level error type
//!
//! ## Contracts
//!
//! | Contract | Shape | Stability |
//! |----------|-------|-----------|
//! | Cluster state | JSON `{NextMachineId, Records:[...]}` | frozen field names, unknown fields ignored |
//! | RPC wire | 4-byte BE length + protobuf envelope | append-only tags |
//! | Change stamp order | (seq, ts, op-rank), Delete > Add | fixed |

pub mod entry;
pub mod error;
pub mod framing;
pub mod machine;
pub mod stamp;
pub mod wire;

pub use entry::{ContentEntry, ContentHash, SIZE_UNKNOWN};
pub use error::WireError;
pub use framing::FrameCodec;
pub use machine::{
    min_heartbeat_time, InvalidLocation, MachineId, MachineLocation, MachineRecord, MachineState,
};
pub use stamp::{ChangeStamp, StampOperation, Stamped};
