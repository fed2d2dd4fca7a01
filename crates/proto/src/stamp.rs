//! # Change Stamps
//!
//! A change stamp is the causal-ordering token minted for every local
//! content mutation. Stamps from one machine are totally ordered by their
//! sequence number; stamps from different machines are compared by the full
//! (sequence, timestamp, operation) triple so that every replica resolves
//! concurrent updates to the same winner.
//!
//! ## Ordering
//!
//! | Priority | Field | Rule |
//! |----------|-------|------|
//! | 1 | `sequence` | higher wins |
//! | 2 | `timestamp` | higher wins (tie-break) |
//! | 3 | `operation` | `Delete` outranks `Add` at identical (seq, ts) |
//!
//! Delete-over-Add at equal stamps means a delete can never be resurrected
//! by a concurrent add carrying the same stamp; re-adding content requires
//! a strictly greater stamp.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two content operations a stamp can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StampOperation {
    Add,
    Delete,
}

impl StampOperation {
    /// Rank used as the final ordering tie-break: `Delete` wins over `Add`.
    pub const fn rank(self) -> u8 {
        match self {
            StampOperation::Add => 0,
            StampOperation::Delete => 1,
        }
    }

    pub const fn is_delete(self) -> bool {
        matches!(self, StampOperation::Delete)
    }
}

/// Causal token for one (machine, hash) mutation.
///
/// Timestamps are truncated to microsecond precision at construction so a
/// stamp survives a wire round-trip bit-identically and comparisons agree
/// on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeStamp {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: StampOperation,
}

impl ChangeStamp {
    pub fn new(sequence: u64, timestamp: DateTime<Utc>, operation: StampOperation) -> Self {
        Self {
            sequence,
            timestamp: truncate_to_micros(timestamp),
            operation,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.operation.is_delete()
    }
}

impl Ord for ChangeStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.operation.rank().cmp(&other.operation.rank()))
    }
}

impl PartialOrd for ChangeStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A value tagged with the stamp that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub stamp: ChangeStamp,
    pub value: T,
}

impl<T> Stamped<T> {
    pub fn new(stamp: ChangeStamp, value: T) -> Self {
        Self { stamp, value }
    }
}

/// Drop sub-microsecond precision. The wire format carries microseconds;
/// anything finer would make a stamp compare differently before and after
/// one hop.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}
