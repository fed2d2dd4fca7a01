//! # DCLT Common Crate
//!
//! Shared utilities for the distributed content tracker.
//!
//! ## Modules
//! - `clock`: injectable UTC time source (`SystemClock`, `VirtualClock`)
//! - `config`: TOML configuration loading
//! - `error`: the workspace-wide error value and result alias

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::TrackerConfig;
pub use error::{ErrorKind, Result, TrackerError};
