//! # Ring Coordination
//!
//! A ring is the small group of machines cooperating on one build
//! (typically 2–50). The first builder in registration order is the
//! leader; there is no election protocol — if the leader leaves, the next
//! builder in order is promoted. A machine belongs to at most one ring at
//! a time, and rings are added or removed wholesale.

use std::collections::HashMap;

use tracing::info;

use dclt_common::{Result, TrackerError};
use dclt_proto::MachineId;

/// One build's machine group. Builder order is registration order and
/// never reshuffled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    id: String,
    builders: Vec<MachineId>,
}

impl Ring {
    /// A ring needs at least one builder and no duplicates.
    pub fn new(id: impl Into<String>, builders: Vec<MachineId>) -> Result<Self> {
        let id = id.into();
        if builders.is_empty() {
            return Err(TrackerError::permanent(format!("ring {id} has no builders")));
        }
        for (i, b) in builders.iter().enumerate() {
            if builders[..i].contains(b) {
                return Err(TrackerError::permanent(format!(
                    "ring {id} lists machine {b} twice"
                )));
            }
        }
        Ok(Self { id, builders })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exactly one leader per ring: the first surviving builder.
    pub fn leader(&self) -> MachineId {
        self.builders[0]
    }

    pub fn builders(&self) -> &[MachineId] {
        &self.builders
    }

    pub fn contains(&self, machine: MachineId) -> bool {
        self.builders.contains(&machine)
    }

    /// Drop a builder. Returns whether the ring is now empty. Removing the
    /// leader promotes the next builder in order.
    fn remove_builder(&mut self, machine: MachineId) -> bool {
        self.builders.retain(|b| *b != machine);
        self.builders.is_empty()
    }
}

/// All live rings, indexed both ways.
#[derive(Debug, Default)]
pub struct RingSet {
    rings: HashMap<String, Ring>,
    by_machine: HashMap<MachineId, String>,
}

impl RingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a whole ring. Rejected if the id is taken or any member is
    /// already in another ring.
    pub fn add_ring(&mut self, ring: Ring) -> Result<()> {
        if self.rings.contains_key(ring.id()) {
            return Err(TrackerError::permanent(format!(
                "ring {} already exists",
                ring.id()
            )));
        }
        if let Some(taken) = ring
            .builders()
            .iter()
            .find(|b| self.by_machine.contains_key(b))
        {
            return Err(TrackerError::permanent(format!(
                "machine {taken} is already in ring {}",
                self.by_machine[taken]
            )));
        }
        info!(ring = ring.id(), builders = ring.builders().len(), "ring added");
        for builder in ring.builders() {
            self.by_machine.insert(*builder, ring.id().to_string());
        }
        self.rings.insert(ring.id().to_string(), ring);
        Ok(())
    }

    /// Tear a ring down, returning its members so the caller can mark them
    /// unavailable in the cluster state.
    pub fn remove_ring(&mut self, id: &str) -> Option<Ring> {
        let ring = self.rings.remove(id)?;
        for builder in ring.builders() {
            self.by_machine.remove(builder);
        }
        info!(ring = id, "ring removed");
        Some(ring)
    }

    /// Remove one machine from whatever ring it is in; an empty ring is
    /// dropped. Leader departure promotes `builders[1]` implicitly.
    pub fn remove_machine(&mut self, machine: MachineId) {
        let Some(ring_id) = self.by_machine.remove(&machine) else {
            return;
        };
        if let Some(ring) = self.rings.get_mut(&ring_id) {
            if ring.remove_builder(machine) {
                self.rings.remove(&ring_id);
            }
        }
    }

    pub fn ring(&self, id: &str) -> Option<&Ring> {
        self.rings.get(id)
    }

    pub fn ring_of(&self, machine: MachineId) -> Option<&Ring> {
        self.by_machine
            .get(&machine)
            .and_then(|id| self.rings.get(id))
    }

    /// The leader of the ring `machine` belongs to, if any.
    pub fn leader_of(&self, machine: MachineId) -> Option<MachineId> {
        self.ring_of(machine).map(Ring::leader)
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: u32) -> MachineId {
        MachineId::new(id)
    }

    fn make_ring(id: &str, machines: &[u32]) -> Ring {
        Ring::new(id, machines.iter().map(|i| m(*i)).collect()).expect("ring")
    }

    #[test]
    fn test_leader_is_first_builder() {
        let ring = make_ring("build-1", &[4, 2, 9]);
        assert_eq!(ring.leader(), m(4));
    }

    #[test]
    fn test_empty_ring_rejected() {
        assert!(Ring::new("b", vec![]).is_err());
    }

    #[test]
    fn test_duplicate_builder_rejected() {
        assert!(Ring::new("b", vec![m(1), m(2), m(1)]).is_err());
    }

    #[test]
    fn test_machine_in_two_rings_rejected() {
        let mut set = RingSet::new();
        set.add_ring(make_ring("r1", &[1, 2])).unwrap();
        let err = set.add_ring(make_ring("r2", &[2, 3])).unwrap_err();
        assert_eq!(err.kind(), dclt_common::ErrorKind::PermanentRejected);
    }

    #[test]
    fn test_leader_departure_promotes_next_in_order() {
        let mut set = RingSet::new();
        set.add_ring(make_ring("r1", &[1, 2, 3])).unwrap();
        set.remove_machine(m(1));
        assert_eq!(set.ring("r1").unwrap().leader(), m(2));
        assert_eq!(set.leader_of(m(3)), Some(m(2)));
    }

    #[test]
    fn test_remove_ring_clears_membership() {
        let mut set = RingSet::new();
        set.add_ring(make_ring("r1", &[1, 2])).unwrap();
        let removed = set.remove_ring("r1").expect("ring");
        assert_eq!(removed.builders(), &[m(1), m(2)]);
        assert!(set.ring_of(m(1)).is_none());
        // members are free to join a new ring
        set.add_ring(make_ring("r2", &[1, 2])).unwrap();
    }

    #[test]
    fn test_last_member_leaving_drops_the_ring() {
        let mut set = RingSet::new();
        set.add_ring(make_ring("r1", &[1])).unwrap();
        set.remove_machine(m(1));
        assert!(set.is_empty());
    }
}
