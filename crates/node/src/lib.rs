//! # DCLT Node Crate
//!
//! The runnable tracker node: CLI parsing and the service that wires the
//! cluster cell, trackers, RPC endpoint and periodic tasks together.

pub mod cli;
pub mod service;

pub use cli::Cli;
pub use service::TrackerNode;
