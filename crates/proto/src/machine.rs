//! # Machine Identity & Cluster Records
//!
//! Machine ids, locations, liveness states and the per-machine record kept
//! by the cluster state machine. The serialized shape of a record —
//! `{Id, Location, State, LastHeartbeatTimeUtc}` — is a backwards
//! compatibility contract: field names never change and unknown fields are
//! ignored on read.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dense non-zero machine identifier assigned by the cluster state machine.
///
/// Ids are stable for the lifetime of the cluster unless reclaimed from a
/// machine that has been dead beyond the reclamation threshold.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MachineId(u32);

impl MachineId {
    /// Wrap a raw id. Zero is reserved as "no machine" and must never be
    /// produced by the allocator.
    pub fn new(raw: u32) -> Self {
        debug_assert!(raw != 0, "machine id 0 is reserved");
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raised when a location string cannot be canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid machine location: {raw}")]
pub struct InvalidLocation {
    pub raw: String,
}

/// Canonical network endpoint of a machine: `grpc://host:port/`.
///
/// Two distinct locations may never simultaneously hold the same id; the
/// cluster state machine enforces that during registration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineLocation(String);

impl MachineLocation {
    /// Parse and canonicalize. Accepts `host:port`, `grpc://host:port` and
    /// `grpc://host:port/`; everything else is rejected.
    pub fn parse(raw: &str) -> Result<Self, InvalidLocation> {
        let err = || InvalidLocation {
            raw: raw.to_string(),
        };
        let trimmed = raw
            .strip_prefix("grpc://")
            .unwrap_or(raw)
            .trim_end_matches('/');
        let (host, port) = trimmed.rsplit_once(':').ok_or_else(err)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(err());
        }
        Ok(Self(format!("grpc://{host}:{port}/")))
    }

    /// The `host:port` part, suitable for dialing.
    pub fn authority(&self) -> &str {
        self.0
            .trim_start_matches("grpc://")
            .trim_end_matches('/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MachineLocation {
    type Error = InvalidLocation;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<MachineLocation> for String {
    fn from(loc: MachineLocation) -> String {
        loc.0
    }
}

/// Liveness state of a machine record.
///
/// The serialized names are a contract; see the state table in the cluster
/// crate for the transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Open,
    Closed,
    DeadUnavailable,
    DeadExpired,
}

impl MachineState {
    /// Available machines participate in sharding: Open or Closed.
    pub const fn is_available(self) -> bool {
        matches!(self, MachineState::Open | MachineState::Closed)
    }

    /// Dead machines are eligible for id reclamation.
    pub const fn is_dead(self) -> bool {
        matches!(self, MachineState::DeadUnavailable | MachineState::DeadExpired)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Open => "Open",
            MachineState::Closed => "Closed",
            MachineState::DeadUnavailable => "DeadUnavailable",
            MachineState::DeadExpired => "DeadExpired",
        };
        f.write_str(name)
    }
}

/// One machine's entry in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(rename = "Id")]
    pub id: MachineId,
    #[serde(rename = "Location")]
    pub location: MachineLocation,
    #[serde(rename = "State")]
    pub state: MachineState,
    #[serde(rename = "LastHeartbeatTimeUtc", with = "heartbeat_time")]
    pub last_heartbeat: DateTime<Utc>,
}

impl MachineRecord {
    /// Fresh record for a newly registered machine.
    pub fn open(id: MachineId, location: MachineLocation, now: DateTime<Utc>) -> Self {
        Self {
            id,
            location,
            state: MachineState::Open,
            last_heartbeat: now,
        }
    }
}

/// The epoch default for `LastHeartbeatTimeUtc`: 0001-01-01T00:00:00 UTC.
pub fn min_heartbeat_time() -> DateTime<Utc> {
    let naive = NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

/// ISO-8601 without a timezone suffix, fractional seconds only when
/// non-zero. This is the exact on-disk shape peers have always produced.
mod heartbeat_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&ts.naive_utc().format(FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let naive = NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)?;
        Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
    }
}
