//! # Tracker Error Types
//!
//! One error value type for the whole tracker, carrying a machine-readable
//! [`ErrorKind`], an operator-facing diagnostic string, and an optional
//! chained cause. There is no error inheritance anywhere in the workspace;
//! components either construct a `TrackerError` directly or attach an
//! underlying error as the source.
//!
//! ## Kinds
//!
//! | Kind | Meaning | Caller behavior |
//! |------|---------|-----------------|
//! | `UnknownMachine` | Id not present in cluster state | Surface |
//! | `NoShards` | Sharding resolved with zero available entries | Surface |
//! | `Transient` | Network / quota failure | Retry with backoff |
//! | `PermanentRejected` | Well-formed request refused by a peer | Surface immediately |
//! | `Cancelled` | Cooperative cancellation | Surface, distinct from failure |
//! | `Corrupted` | Serialization mismatch | Fatal to the operation, never the process |

use std::fmt;

use thiserror::Error;

/// Machine-readable classification of a tracker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Machine id not present in the cluster state.
    UnknownMachine,
    /// The sharding scheme was asked to resolve with zero available shards.
    NoShards,
    /// Network or quota failure; safe to retry.
    Transient,
    /// Request was well-formed but refused; retrying will not help.
    PermanentRejected,
    /// Operation was cancelled cooperatively.
    Cancelled,
    /// Serialization mismatch; the affected operation is lost.
    Corrupted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UnknownMachine => "unknown machine",
            ErrorKind::NoShards => "no shards",
            ErrorKind::Transient => "transient",
            ErrorKind::PermanentRejected => "permanent rejection",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Corrupted => "corrupted",
        };
        f.write_str(name)
    }
}

/// A tracker failure: kind, diagnostic, optional chained cause.
#[derive(Debug, Error)]
#[error("{kind}: {diagnostic}")]
pub struct TrackerError {
    kind: ErrorKind,
    diagnostic: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TrackerError {
    pub fn new(kind: ErrorKind, diagnostic: impl Into<String>) -> Self {
        Self {
            kind,
            diagnostic: diagnostic.into(),
            source: None,
        }
    }

    /// Attach the underlying error that produced this failure.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn unknown_machine(id: u32) -> Self {
        Self::new(ErrorKind::UnknownMachine, format!("machine id {id}"))
    }

    pub fn no_shards() -> Self {
        Self::new(ErrorKind::NoShards, "no available shards")
    }

    pub fn transient(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, diagnostic)
    }

    pub fn permanent(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentRejected, diagnostic)
    }

    pub fn cancelled(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, diagnostic)
    }

    pub fn corrupted(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corrupted, diagnostic)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_kind_and_diagnostic() {
        let err = TrackerError::transient("dial tcp 10.0.0.1:7070 refused");
        let msg = err.to_string();
        assert!(msg.contains("transient"));
        assert!(msg.contains("refused"));
    }

    #[test]
    fn test_source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = TrackerError::transient("update hop failed").with_source(io);
        let source = std::error::Error::source(&err).expect("chained cause");
        assert!(source.to_string().contains("reset"));
    }

    #[test]
    fn test_kind_queries() {
        assert!(TrackerError::transient("x").is_transient());
        assert!(TrackerError::cancelled("x").is_cancelled());
        assert!(!TrackerError::permanent("x").is_transient());
        assert_eq!(TrackerError::no_shards().kind(), ErrorKind::NoShards);
        assert_eq!(
            TrackerError::unknown_machine(7).kind(),
            ErrorKind::UnknownMachine
        );
    }
}
