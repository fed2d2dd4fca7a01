//! # Wire Messages
//!
//! Field-tagged (protobuf) request/response messages for the
//! `Cache.ContentTracker` RPC service, plus the conversions between wire
//! and domain types. Tags are append-only: adding a field must never break
//! an older peer, so existing tags are frozen.
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ RpcRequest / RpcResponse      │  envelope (service, method, body)
//! ├───────────────────────────────┤
//! │ UpdateLocations / GetLocations│  method payloads
//! ├───────────────────────────────┤
//! │ LocationEntry, StampedLocation│  content entries on the wire
//! └───────────────────────────────┘
//! ```

use chrono::DateTime;
use prost::Message;

use crate::entry::{ContentEntry, ContentHash};
use crate::error::WireError;
use crate::machine::MachineId;
use crate::stamp::{ChangeStamp, StampOperation};

/// RPC service name carried in every request envelope.
pub const SERVICE: &str = "Cache.ContentTracker";
/// Method name for location updates.
pub const METHOD_UPDATE: &str = "UpdateLocations";
/// Method name for location lookups.
pub const METHOD_GET: &str = "GetLocations";

/// Content operation on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireOperation {
    Add = 0,
    Delete = 1,
}

/// Envelope status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum RpcStatus {
    Ok = 0,
    Rejected = 1,
    Corrupted = 2,
    Internal = 3,
}

/// One machine's surviving stamped operation for a hash.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StampedLocation {
    #[prost(uint32, tag = "1")]
    pub machine: u32,
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
    #[prost(sint64, tag = "3")]
    pub timestamp_micros: i64,
    #[prost(enumeration = "WireOperation", tag = "4")]
    pub operation: i32,
}

/// Content entry on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocationEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
    #[prost(sint64, tag = "2")]
    pub size: i64,
    #[prost(message, repeated, tag = "3")]
    pub operations: Vec<StampedLocation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateLocationsRequest {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<LocationEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateLocationsResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLocationsRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub hashes: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLocationsResponse {
    /// Parallel to the requested hashes; missing hashes yield empty entries.
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<LocationEntry>,
}

/// Request envelope: service + method select the handler, `body` is the
/// encoded method payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

/// Response envelope. A non-`Ok` status surfaces on the client as a
/// transport-level error; there is no in-band error object.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(enumeration = "RpcStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

impl RpcRequest {
    pub fn new(method: &str, body: impl Message) -> Self {
        Self {
            service: SERVICE.to_string(),
            method: method.to_string(),
            body: body.encode_to_vec(),
        }
    }
}

impl RpcResponse {
    pub fn ok(body: impl Message) -> Self {
        Self {
            status: RpcStatus::Ok as i32,
            message: String::new(),
            body: body.encode_to_vec(),
        }
    }

    pub fn fault(status: RpcStatus, message: impl Into<String>) -> Self {
        Self {
            status: status as i32,
            message: message.into(),
            body: Vec::new(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DOMAIN <-> WIRE CONVERSIONS
// ════════════════════════════════════════════════════════════════════════════

impl From<&ContentEntry> for LocationEntry {
    fn from(entry: &ContentEntry) -> Self {
        let operations = entry
            .operations()
            .map(|stamped| StampedLocation {
                machine: stamped.value.get(),
                sequence: stamped.stamp.sequence,
                timestamp_micros: stamped.stamp.timestamp.timestamp_micros(),
                operation: match stamped.stamp.operation {
                    StampOperation::Add => WireOperation::Add as i32,
                    StampOperation::Delete => WireOperation::Delete as i32,
                },
            })
            .collect();
        Self {
            hash: entry.hash().as_bytes().to_vec(),
            size: entry.size(),
            operations,
        }
    }
}

impl TryFrom<&LocationEntry> for ContentEntry {
    type Error = WireError;

    fn try_from(wire: &LocationEntry) -> Result<Self, WireError> {
        let hash = ContentHash::from_slice(&wire.hash)
            .ok_or_else(|| WireError::decode(format!("bad hash length {}", wire.hash.len())))?;
        let mut entry = ContentEntry::empty(hash);
        for op in &wire.operations {
            if op.machine == 0 {
                return Err(WireError::decode("machine id 0 on the wire"));
            }
            let operation = match WireOperation::try_from(op.operation) {
                Ok(WireOperation::Add) => StampOperation::Add,
                Ok(WireOperation::Delete) => StampOperation::Delete,
                Err(_) => {
                    return Err(WireError::decode(format!(
                        "unknown operation {}",
                        op.operation
                    )))
                }
            };
            let timestamp = DateTime::from_timestamp_micros(op.timestamp_micros)
                .ok_or_else(|| WireError::decode("timestamp out of range"))?;
            entry.apply(
                MachineId::new(op.machine),
                ChangeStamp::new(op.sequence, timestamp, operation),
                wire.size,
            );
        }
        Ok(entry)
    }
}

/// Decode a batch of wire entries, failing on the first corrupt one.
pub fn decode_entries(wire: &[LocationEntry]) -> Result<Vec<ContentEntry>, WireError> {
    wire.iter().map(ContentEntry::try_from).collect()
}

/// Encode a batch of domain entries.
pub fn encode_entries(entries: &[ContentEntry]) -> Vec<LocationEntry> {
    entries.iter().map(LocationEntry::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn make_entry() -> ContentEntry {
        let mut e = ContentEntry::empty(ContentHash::digest(b"payload"));
        e.apply(
            MachineId::new(3),
            ChangeStamp::new(2, Utc.timestamp_opt(1_700_000_000, 0).unwrap(), StampOperation::Add),
            4096,
        );
        e.apply(
            MachineId::new(7),
            ChangeStamp::new(
                5,
                Utc.timestamp_opt(1_700_000_100, 250_000_000).unwrap(),
                StampOperation::Delete,
            ),
            4096,
        );
        e
    }

    #[test]
    fn test_entry_survives_wire_roundtrip() {
        let entry = make_entry();
        let wire = LocationEntry::from(&entry);
        let bytes = wire.encode_to_vec();
        let decoded = LocationEntry::decode(bytes.as_slice()).expect("decode");
        let back = ContentEntry::try_from(&decoded).expect("convert");
        assert_eq!(back, entry);
    }

    #[test]
    fn test_bad_hash_length_is_rejected() {
        let wire = LocationEntry {
            hash: vec![1, 2, 3],
            size: 10,
            operations: vec![],
        };
        assert!(ContentEntry::try_from(&wire).is_err());
    }

    #[test]
    fn test_zero_machine_id_is_rejected() {
        let mut wire = LocationEntry::from(&make_entry());
        wire.operations[0].machine = 0;
        assert!(ContentEntry::try_from(&wire).is_err());
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // A future peer appends a field with tag 15: varint 99.
        let mut bytes = LocationEntry::from(&make_entry()).encode_to_vec();
        bytes.extend_from_slice(&[0x78, 0x63]);
        let decoded = LocationEntry::decode(bytes.as_slice()).expect("decode with unknown field");
        let back = ContentEntry::try_from(&decoded).expect("convert");
        assert_eq!(back, make_entry());
    }

    #[test]
    fn test_request_envelope_targets_the_tracker_service() {
        let req = RpcRequest::new(METHOD_GET, GetLocationsRequest { hashes: vec![] });
        assert_eq!(req.service, "Cache.ContentTracker");
        assert_eq!(req.method, "GetLocations");
    }
}
