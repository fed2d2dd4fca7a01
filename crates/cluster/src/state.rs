//! # Cluster State Machine
//!
//! A deterministic, pure-functional state machine over the set of machine
//! records. It is the ONLY authorized path for assigning machine ids and
//! for liveness transitions; every mutator takes `&self` and returns a new
//! value, so readers keep whatever snapshot they already hold.
//!
//! ## Guarantees
//!
//! - **Deterministic**: the same inputs always produce the same state.
//! - **Pure**: no IO, no clock reads — `now` is always a parameter.
//! - **Id safety**: an id is never reassigned while its record is Open or
//!   Closed; only dead records past the reclamation threshold are reused.
//!
//! ## Liveness transitions
//!
//! | From | Condition | To |
//! |------|-----------|----|
//! | Open | elapsed ≥ active→expired | DeadExpired |
//! | Open | elapsed ≥ active→unavailable | DeadUnavailable |
//! | Open | elapsed ≥ active→closed | Closed |
//! | Closed | elapsed ≥ closed→expired | DeadExpired |
//! | Dead* | — | unchanged |
//!
//! Rows are evaluated top to bottom: a record that has been inactive long
//! enough for expiry skips Closed entirely.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use dclt_common::{Result, TrackerConfig, TrackerError};
use dclt_proto::{MachineId, MachineLocation, MachineRecord, MachineState};

/// Inactivity thresholds consumed by the liveness sweep and by id
/// reclamation.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    pub active_to_closed: Duration,
    pub active_to_expired: Duration,
    pub closed_to_expired: Duration,
    pub active_to_unavailable: Duration,
}

impl LivenessConfig {
    pub fn from_tracker_config(cfg: &TrackerConfig) -> Self {
        Self {
            active_to_closed: Duration::seconds(cfg.active_to_closed as i64),
            active_to_expired: Duration::seconds(cfg.active_to_expired as i64),
            closed_to_expired: Duration::seconds(cfg.closed_to_expired as i64),
            active_to_unavailable: Duration::seconds(cfg.active_to_unavailable as i64),
        }
    }
}

/// Immutable cluster membership value.
///
/// Serializes to the frozen JSON contract
/// `{"NextMachineId":…,"Records":[…]}`; unknown fields are ignored on read
/// and records round-trip losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(rename = "NextMachineId")]
    next_machine_id: u32,
    #[serde(rename = "Records", with = "records_as_vec")]
    records: BTreeMap<MachineId, MachineRecord>,
}

impl ClusterState {
    /// Empty cluster; the first registration receives id 1.
    pub fn new() -> Self {
        Self {
            next_machine_id: 1,
            records: BTreeMap::new(),
        }
    }

    pub fn next_machine_id(&self) -> u32 {
        self.next_machine_id
    }

    pub fn record(&self, id: MachineId) -> Option<&MachineRecord> {
        self.records.get(&id)
    }

    /// Records in id order.
    pub fn records(&self) -> impl Iterator<Item = &MachineRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn location_of(&self, id: MachineId) -> Option<&MachineLocation> {
        self.records.get(&id).map(|r| &r.location)
    }

    /// The machine is present and Open or Closed.
    pub fn is_available(&self, id: MachineId) -> bool {
        self.records
            .get(&id)
            .is_some_and(|r| r.state.is_available())
    }

    /// Register `location`, assigning an id.
    ///
    /// - An existing Open/Closed record for the location keeps its id.
    /// - Otherwise the smallest reclaimable id is reused: its record must
    ///   already be in a dead state AND inactive for at least
    ///   `active_to_unavailable`.
    /// - Otherwise a fresh id is allocated.
    pub fn register_machine(
        &self,
        cfg: &LivenessConfig,
        location: &MachineLocation,
        now: DateTime<Utc>,
    ) -> (Self, MachineId) {
        if let Some(existing) = self
            .records
            .values()
            .find(|r| r.location == *location && r.state.is_available())
        {
            return (self.clone(), existing.id);
        }

        let reclaimable = self
            .records
            .values()
            .find(|r| r.state.is_dead() && now - r.last_heartbeat >= cfg.active_to_unavailable)
            .map(|r| r.id);

        let mut next = self.clone();
        let id = match reclaimable {
            Some(id) => id,
            None => {
                let id = MachineId::new(next.next_machine_id);
                next.next_machine_id += 1;
                id
            }
        };
        next.records
            .insert(id, MachineRecord::open(id, location.clone(), now));
        (next, id)
    }

    /// Unconditional upsert used only while migrating from a legacy id
    /// scheme. Raises the allocator past `id`.
    pub fn force_register_machine(
        &self,
        id: MachineId,
        location: MachineLocation,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.records
            .insert(id, MachineRecord::open(id, location, now));
        next.next_machine_id = next.next_machine_id.max(id.get() + 1);
        next
    }

    /// Record a heartbeat and the sender's desired state.
    ///
    /// The sender's location must match the record: after an id has been
    /// reclaimed, heartbeats from the previous holder are indistinguishable
    /// from an unknown machine and are rejected as such.
    pub fn heartbeat(
        &self,
        id: MachineId,
        location: &MachineLocation,
        now: DateTime<Utc>,
        desired_state: MachineState,
    ) -> Result<(Self, MachineState)> {
        let record = self
            .records
            .get(&id)
            .ok_or_else(|| TrackerError::unknown_machine(id.get()))?;
        if record.location != *location {
            return Err(TrackerError::unknown_machine(id.get())
                .with_source(dclt_proto::InvalidLocation {
                    raw: format!("stale heartbeat from {location}"),
                }));
        }
        let previous = record.state;
        let mut next = self.clone();
        if let Some(r) = next.records.get_mut(&id) {
            r.last_heartbeat = now;
            r.state = desired_state;
        }
        Ok((next, previous))
    }

    /// Apply the liveness table to every record.
    pub fn transition_inactive(&self, cfg: &LivenessConfig, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        for record in next.records.values_mut() {
            let elapsed = now - record.last_heartbeat;
            record.state = match record.state {
                MachineState::Open => {
                    if elapsed >= cfg.active_to_expired {
                        MachineState::DeadExpired
                    } else if elapsed >= cfg.active_to_unavailable {
                        MachineState::DeadUnavailable
                    } else if elapsed >= cfg.active_to_closed {
                        MachineState::Closed
                    } else {
                        MachineState::Open
                    }
                }
                MachineState::Closed => {
                    if elapsed >= cfg.closed_to_expired {
                        MachineState::DeadExpired
                    } else {
                        MachineState::Closed
                    }
                }
                dead => dead,
            };
        }
        next
    }

    /// Register several locations in one sweep. Ids of Open/Closed records
    /// are never reclaimed by later registrations in the same sweep.
    pub fn register_many(
        &self,
        cfg: &LivenessConfig,
        locations: &[MachineLocation],
        now: DateTime<Utc>,
    ) -> (Self, Vec<MachineId>) {
        let mut state = self.clone();
        let mut ids = Vec::with_capacity(locations.len());
        for location in locations {
            let (next, id) = state.register_machine(cfg, location, now);
            state = next;
            ids.push(id);
        }
        (state, ids)
    }

    /// Force the given machines to `DeadUnavailable`, e.g. when their ring
    /// is torn down. Heartbeat times are left untouched so reclamation
    /// still honors the inactivity threshold.
    pub fn mark_unavailable(&self, ids: &[MachineId]) -> Self {
        let mut next = self.clone();
        for id in ids {
            if let Some(r) = next.records.get_mut(id) {
                if !r.state.is_dead() {
                    r.state = MachineState::DeadUnavailable;
                }
            }
        }
        next
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

/// `Records` is an array on the wire but an id-indexed map in memory.
mod records_as_vec {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use dclt_proto::{MachineId, MachineRecord};

    pub fn serialize<S>(
        records: &BTreeMap<MachineId, MachineRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(records.values())
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<MachineId, MachineRecord>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let records = Vec::<MachineRecord>::deserialize(deserializer)?;
        Ok(records.into_iter().map(|r| (r.id, r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dclt_proto::min_heartbeat_time;

    fn cfg() -> LivenessConfig {
        LivenessConfig {
            active_to_closed: Duration::seconds(120),
            active_to_expired: Duration::seconds(1800),
            closed_to_expired: Duration::seconds(900),
            active_to_unavailable: Duration::seconds(600),
        }
    }

    fn loc(name: &str) -> MachineLocation {
        MachineLocation::parse(&format!("{name}:7070")).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    // ── registration ─────────────────────────────────────────────────────

    #[test]
    fn test_first_registration_gets_id_one() {
        let (state, id) = ClusterState::new().register_machine(&cfg(), &loc("a"), t0());
        assert_eq!(id, MachineId::new(1));
        assert_eq!(state.next_machine_id(), 2);
        assert_eq!(state.record(id).unwrap().state, MachineState::Open);
    }

    #[test]
    fn test_reregistering_open_location_keeps_id() {
        let (state, id1) = ClusterState::new().register_machine(&cfg(), &loc("a"), t0());
        let (state, id2) = state.register_machine(&cfg(), &loc("a"), t0());
        assert_eq!(id1, id2);
        assert_eq!(state.len(), 1);
        assert_eq!(state.next_machine_id(), 2);
    }

    #[test]
    fn test_distinct_locations_get_distinct_ids() {
        let (state, ids) =
            ClusterState::new().register_many(&cfg(), &[loc("a"), loc("b"), loc("c")], t0());
        assert_eq!(
            ids,
            vec![MachineId::new(1), MachineId::new(2), MachineId::new(3)]
        );
        assert_eq!(state.next_machine_id(), 4);
    }

    #[test]
    fn test_open_id_is_never_reclaimed() {
        let (state, _) = ClusterState::new().register_machine(&cfg(), &loc("a"), t0());
        // Far past every threshold, but no liveness sweep has run: the
        // record is still Open and its id must not be reused.
        let late = t0() + Duration::seconds(100_000);
        let (state, id2) = state.register_machine(&cfg(), &loc("b"), late);
        assert_eq!(id2, MachineId::new(2));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_dead_id_is_reclaimed_after_threshold() {
        let c = cfg();
        let (state, id1) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        let late = t0() + Duration::seconds(100_000);
        let state = state.transition_inactive(&c, late);
        assert!(state.record(id1).unwrap().state.is_dead());

        let (state, id3) = state.register_machine(&c, &loc("c"), late);
        assert_eq!(id3, id1);
        assert_eq!(state.record(id3).unwrap().location, loc("c"));
        assert_eq!(state.record(id3).unwrap().state, MachineState::Open);
    }

    #[test]
    fn test_dead_but_recent_id_is_not_reclaimed() {
        let c = cfg();
        let (state, id1) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        // Freshly marked unavailable: dead state but elapsed < threshold.
        let state = state.mark_unavailable(&[id1]);
        let (state, id2) =
            state.register_machine(&c, &loc("b"), t0() + Duration::seconds(10));
        assert_eq!(id2, MachineId::new(2));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_reclamation_scenario_end_to_end() {
        let c = cfg();
        let state = ClusterState::new();

        // node1 -> id 1
        let (state, id1) = state.register_machine(&c, &loc("node1"), t0());
        assert_eq!(id1, MachineId::new(1));

        // past active_to_unavailable, but node1 still Open: node2 -> id 2
        let t1 = t0() + c.active_to_unavailable + Duration::seconds(1);
        let (state, id2) = state.register_machine(&c, &loc("node2"), t1);
        assert_eq!(id2, MachineId::new(2));

        // sweep marks node1 dead; node3 reclaims id 1
        let t2 = t1 + c.active_to_unavailable + Duration::seconds(1);
        let state = state.transition_inactive(&c, t2);
        assert_eq!(
            state.record(id1).unwrap().state,
            MachineState::DeadUnavailable
        );
        let (state, id3) = state.register_machine(&c, &loc("node3"), t2);
        assert_eq!(id3, MachineId::new(1));
        assert_eq!(state.record(id3).unwrap().location, loc("node3"));
    }

    #[test]
    fn test_force_register_raises_allocator() {
        let state = ClusterState::new().force_register_machine(MachineId::new(9), loc("m"), t0());
        assert_eq!(state.next_machine_id(), 10);
        let (_, id) = state.register_machine(&cfg(), &loc("n"), t0());
        assert_eq!(id, MachineId::new(10));
    }

    // ── heartbeat ────────────────────────────────────────────────────────

    #[test]
    fn test_heartbeat_updates_record() {
        let (state, id) = ClusterState::new().register_machine(&cfg(), &loc("a"), t0());
        let later = t0() + Duration::seconds(30);
        let (state, prev) = state
            .heartbeat(id, &loc("a"), later, MachineState::Open)
            .unwrap();
        assert_eq!(prev, MachineState::Open);
        assert_eq!(state.record(id).unwrap().last_heartbeat, later);
    }

    #[test]
    fn test_heartbeat_unknown_id_fails() {
        let err = ClusterState::new()
            .heartbeat(MachineId::new(5), &loc("a"), t0(), MachineState::Open)
            .unwrap_err();
        assert_eq!(err.kind(), dclt_common::ErrorKind::UnknownMachine);
    }

    #[test]
    fn test_stale_heartbeat_after_reclamation_is_unknown() {
        let c = cfg();
        let (state, id1) = ClusterState::new().register_machine(&c, &loc("old"), t0());
        let late = t0() + Duration::seconds(100_000);
        let state = state.transition_inactive(&c, late);
        let (state, reclaimed) = state.register_machine(&c, &loc("new"), late);
        assert_eq!(reclaimed, id1);

        // the previous holder wakes up and heartbeats its reclaimed id
        let err = state
            .heartbeat(id1, &loc("old"), late, MachineState::Open)
            .unwrap_err();
        assert_eq!(err.kind(), dclt_common::ErrorKind::UnknownMachine);

        // the new holder heartbeats fine
        assert!(state
            .heartbeat(id1, &loc("new"), late, MachineState::Open)
            .is_ok());
    }

    #[test]
    fn test_heartbeat_can_close_a_machine() {
        let (state, id) = ClusterState::new().register_machine(&cfg(), &loc("a"), t0());
        let (state, prev) = state
            .heartbeat(id, &loc("a"), t0(), MachineState::Closed)
            .unwrap();
        assert_eq!(prev, MachineState::Open);
        assert_eq!(state.record(id).unwrap().state, MachineState::Closed);
    }

    // ── liveness transitions ─────────────────────────────────────────────

    #[test]
    fn test_open_to_closed_after_active_to_closed() {
        let c = cfg();
        let (state, id) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        let state = state.transition_inactive(&c, t0() + c.active_to_closed);
        assert_eq!(state.record(id).unwrap().state, MachineState::Closed);
    }

    #[test]
    fn test_open_to_unavailable_after_active_to_unavailable() {
        let c = cfg();
        let (state, id) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        let state = state.transition_inactive(&c, t0() + c.active_to_unavailable);
        assert_eq!(
            state.record(id).unwrap().state,
            MachineState::DeadUnavailable
        );
    }

    #[test]
    fn test_active_to_expired_skips_closed() {
        let c = cfg();
        let (state, id) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        // expired dominates: the record never pauses at Closed
        let state = state.transition_inactive(&c, t0() + c.active_to_expired);
        assert_eq!(state.record(id).unwrap().state, MachineState::DeadExpired);
    }

    #[test]
    fn test_closed_to_expired() {
        let c = cfg();
        let (state, id) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        let (state, _) = state
            .heartbeat(id, &loc("a"), t0(), MachineState::Closed)
            .unwrap();
        let state = state.transition_inactive(&c, t0() + c.closed_to_expired);
        assert_eq!(state.record(id).unwrap().state, MachineState::DeadExpired);
    }

    #[test]
    fn test_dead_records_stay_dead() {
        let c = cfg();
        let (state, id) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        let state = state.mark_unavailable(&[id]);
        let state = state.transition_inactive(&c, t0() + Duration::seconds(1_000_000));
        assert_eq!(
            state.record(id).unwrap().state,
            MachineState::DeadUnavailable
        );
    }

    #[test]
    fn test_fresh_record_is_untouched_by_sweep() {
        let c = cfg();
        let (state, id) = ClusterState::new().register_machine(&c, &loc("a"), t0());
        let state = state.transition_inactive(&c, t0() + Duration::seconds(1));
        assert_eq!(state.record(id).unwrap().state, MachineState::Open);
    }

    // ── serialization contract ───────────────────────────────────────────

    #[test]
    fn test_contract_encoding_is_exact() {
        let mut state = ClusterState::new();
        state = state.force_register_machine(
            MachineId::new(1),
            MachineLocation::parse("grpc://node:1234/").unwrap(),
            min_heartbeat_time(),
        );
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"NextMachineId":2,"Records":[{"Id":1,"Location":"grpc://node:1234/","State":"Open","LastHeartbeatTimeUtc":"0001-01-01T00:00:00"}]}"#
        );
    }

    #[test]
    fn test_roundtrip_preserves_full_value() {
        let c = cfg();
        let (state, ids) =
            ClusterState::new().register_many(&c, &[loc("a"), loc("b"), loc("c")], t0());
        let state = state.mark_unavailable(&[ids[1]]);
        let json = serde_json::to_string(&state).unwrap();
        let back: ClusterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = r#"{"NextMachineId":3,"Records":[],"Epoch":17}"#;
        let state: ClusterState = serde_json::from_str(json).unwrap();
        assert_eq!(state.next_machine_id(), 3);
        assert!(state.is_empty());
    }
}
