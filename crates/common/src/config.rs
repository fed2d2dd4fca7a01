//! Config loader using TOML and serde.
//!
//! All keys are optional in the file; defaults target a small datacenter
//! deployment. Liveness thresholds are in seconds, queue and RPC settings in
//! milliseconds (the `_ms` suffix marks the latter).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TrackerError};

/// Host-supplied tracker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Bind address for the tracker RPC server, e.g. "0.0.0.0:7070".
    pub bind_addr: String,

    /// Inactivity before an Open machine is considered Closed (seconds).
    pub active_to_closed: u64,

    /// Inactivity before an Open machine is considered DeadExpired (seconds).
    /// Must be several multiples of `heartbeat_interval`.
    pub active_to_expired: u64,

    /// Inactivity before a Closed machine is considered DeadExpired (seconds).
    pub closed_to_expired: u64,

    /// Inactivity before a machine is considered DeadUnavailable (seconds).
    /// Also the minimum age of a dead record before its id may be reclaimed.
    pub active_to_unavailable: u64,

    /// Interval between heartbeats issued by the node service (seconds).
    pub heartbeat_interval: u64,

    /// Entries accumulated before the batching queue flushes.
    pub event_batch_size: usize,

    /// Nagle interval of the batching queue (milliseconds): a partial batch
    /// is flushed this long after its first entry.
    pub event_nagle_interval: u64,

    /// Per-RPC bound, connect plus exchange (milliseconds).
    pub remote_construction_timeout_ms: u64,

    /// Retry attempts for transient hop failures.
    pub retry_attempts: u32,

    /// Cap on the total time spent retrying one hop (milliseconds).
    pub max_remote_wait_ms: u64,

    /// How long a fully tombstoned entry is retained (seconds).
    pub tombstone_retention: u64,

    /// Lock stripes in the local content tracker.
    pub stripe_count: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            bind_addr: "127.0.0.1:7070".to_string(),
            active_to_closed: 120,
            active_to_expired: 1800,
            closed_to_expired: 900,
            active_to_unavailable: 600,
            heartbeat_interval: 30,
            event_batch_size: 64,
            event_nagle_interval: 500,
            remote_construction_timeout_ms: 10_000,
            retry_attempts: 3,
            max_remote_wait_ms: 30_000,
            tombstone_retention: 3600,
            stripe_count: 64,
        }
    }
}

impl TrackerConfig {
    pub fn nagle_interval(&self) -> Duration {
        Duration::from_millis(self.event_nagle_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_construction_timeout_ms)
    }

    pub fn max_remote_wait(&self) -> Duration {
        Duration::from_millis(self.max_remote_wait_ms)
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tombstone_retention as i64)
    }
}

/// Load config from a TOML file path.
/// A missing file or a parse failure is an error; unknown keys are ignored.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<TrackerConfig> {
    let p = path.as_ref();
    let s = fs::read_to_string(p).map_err(|e| {
        TrackerError::corrupted(format!("read config {}", p.display())).with_source(e)
    })?;
    let cfg: TrackerConfig = toml::from_str(&s).map_err(|e| {
        TrackerError::corrupted(format!("parse config {}", p.display())).with_source(e)
    })?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let def = TrackerConfig::default();
        assert_eq!(def.remote_construction_timeout_ms, 10_000);
        assert!(def.active_to_expired > def.heartbeat_interval * 4);
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        use std::io::Write;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            bind_addr = "0.0.0.0:7171"
            active_to_closed = 60
            active_to_unavailable = 300
            event_batch_size = 16
            event_nagle_interval = 250
        "#;
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "{}", toml).expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.bind_addr, "0.0.0.0:7171");
        assert_eq!(cfg.active_to_closed, 60);
        assert_eq!(cfg.event_batch_size, 16);
        // untouched keys fall back to defaults
        assert_eq!(cfg.retry_attempts, 3);
    }

    #[test]
    fn test_load_missing_file_is_corrupted() {
        let err = load_from_file("/definitely/not/here.toml").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupted);
    }
}
