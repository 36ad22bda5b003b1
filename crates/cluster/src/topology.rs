//! Cluster topology model and hash-slot math.

use std::collections::HashSet;

use crate::error::{Error, Result};

/// Total number of hash slots in a Redis cluster keyspace.
pub const HASH_SLOTS: u16 = 16384;

/// The fixed partition of ports into masters and replicas.
///
/// Immutable once constructed. Validated up front: at least one master, no
/// duplicate ports, and the replica count must be a whole multiple of the
/// master count so every shard gets the same number of replicas (a remainder
/// would otherwise be silently dropped from replication).
#[derive(Clone, Debug)]
pub struct ClusterTopology {
    master_ports: Vec<u16>,
    replica_ports: Vec<u16>,
}

impl ClusterTopology {
    /// Create a validated topology.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTopology` if there are no masters, a port
    /// appears twice, or the replica count is not a multiple of the master
    /// count.
    pub fn new(master_ports: Vec<u16>, replica_ports: Vec<u16>) -> Result<Self> {
        if master_ports.is_empty() {
            return Err(Error::InvalidTopology(
                "at least one master is required".to_string(),
            ));
        }

        if replica_ports.len() % master_ports.len() != 0 {
            return Err(Error::InvalidTopology(format!(
                "replica count {} is not a multiple of master count {}",
                replica_ports.len(),
                master_ports.len()
            )));
        }

        let mut seen = HashSet::new();
        for &port in master_ports.iter().chain(&replica_ports) {
            if !seen.insert(port) {
                return Err(Error::InvalidTopology(format!(
                    "port {port} is assigned to more than one node"
                )));
            }
        }

        Ok(Self {
            master_ports,
            replica_ports,
        })
    }

    /// Master ports, in shard order.
    #[must_use]
    pub fn master_ports(&self) -> &[u16] {
        &self.master_ports
    }

    /// Replica ports, in attachment order.
    #[must_use]
    pub fn replica_ports(&self) -> &[u16] {
        &self.replica_ports
    }

    /// Number of masters.
    #[must_use]
    pub fn master_count(&self) -> usize {
        self.master_ports.len()
    }

    /// Number of replicas.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.replica_ports.len()
    }

    /// Total number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.master_ports.len() + self.replica_ports.len()
    }

    /// The rendezvous node every other node introduces itself to: the first
    /// master.
    #[must_use]
    pub fn meet_target(&self) -> u16 {
        self.master_ports[0]
    }

    /// Replicas attached to each master. Zero for a replica-free topology.
    #[must_use]
    pub fn replicas_per_shard(&self) -> usize {
        self.replica_ports.len() / self.master_ports.len()
    }

    /// Index of the master the given replica attaches to. Replicas are
    /// assigned in contiguous blocks of `replicas_per_shard`, in master
    /// order. `None` when the topology has no replicas or the index is out
    /// of range.
    #[must_use]
    pub fn master_for_replica(&self, replica_index: usize) -> Option<usize> {
        let per_shard = self.replicas_per_shard();
        if per_shard == 0 || replica_index >= self.replica_count() {
            return None;
        }
        Some(replica_index / per_shard)
    }

    /// The hash slots owned by the given master: every slot `s` in
    /// `[0, HASH_SLOTS)` with `s % master_count == master_index`. The
    /// round-robin stride guarantees each slot is claimed exactly once
    /// across all masters.
    #[must_use]
    pub fn slots_for_master(&self, master_index: usize) -> Vec<u16> {
        (0..HASH_SLOTS)
            .filter(|&slot| usize::from(slot) % self.master_count() == master_index)
            .collect()
    }

    /// Every port in the topology: masters first, then replicas, in their
    /// original order.
    #[must_use]
    pub fn all_ports(&self) -> Vec<u16> {
        self.master_ports
            .iter()
            .chain(&self.replica_ports)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_by_three() -> ClusterTopology {
        ClusterTopology::new(vec![7000, 7001, 7002], vec![7100, 7101, 7102]).unwrap()
    }

    #[test]
    fn rejects_empty_masters() {
        assert!(matches!(
            ClusterTopology::new(vec![], vec![7100]),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn rejects_unbalanced_replicas() {
        assert!(matches!(
            ClusterTopology::new(vec![7000, 7001], vec![7100, 7101, 7102]),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn rejects_duplicate_ports() {
        assert!(matches!(
            ClusterTopology::new(vec![7000, 7001], vec![7000, 7100]),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn accepts_replica_free_topology() {
        let topology = ClusterTopology::new(vec![7000], vec![]).unwrap();
        assert_eq!(topology.replicas_per_shard(), 0);
        assert_eq!(topology.node_count(), 1);
    }

    #[test]
    fn slot_partition_covers_every_slot_exactly_once() {
        let topology = three_by_three();

        let mut owned = vec![0u8; usize::from(HASH_SLOTS)];
        for master in 0..topology.master_count() {
            for slot in topology.slots_for_master(master) {
                owned[usize::from(slot)] += 1;
            }
        }

        assert!(owned.iter().all(|&count| count == 1));
    }

    #[test]
    fn slot_partition_is_strided_not_ranged() {
        let topology = three_by_three();

        assert_eq!(&topology.slots_for_master(0)[..3], &[0, 3, 6]);
        assert_eq!(&topology.slots_for_master(1)[..3], &[1, 4, 7]);
        assert_eq!(&topology.slots_for_master(2)[..3], &[2, 5, 8]);
    }

    #[test]
    fn replicas_attach_in_contiguous_blocks() {
        let topology =
            ClusterTopology::new(vec![7000, 7001], vec![7100, 7101, 7102, 7103]).unwrap();

        assert_eq!(topology.replicas_per_shard(), 2);
        assert_eq!(topology.master_for_replica(0), Some(0));
        assert_eq!(topology.master_for_replica(1), Some(0));
        assert_eq!(topology.master_for_replica(2), Some(1));
        assert_eq!(topology.master_for_replica(3), Some(1));
        assert_eq!(topology.master_for_replica(4), None);
    }

    #[test]
    fn replica_free_topology_has_no_replica_mapping() {
        let topology = ClusterTopology::new(vec![7000], vec![]).unwrap();

        assert_eq!(topology.master_for_replica(0), None);
    }

    #[test]
    fn one_replica_per_shard_maps_one_to_one() {
        let topology = three_by_three();

        for replica in 0..3 {
            assert_eq!(topology.master_for_replica(replica), Some(replica));
        }
    }

    #[test]
    fn ports_are_masters_then_replicas_in_order() {
        let topology = three_by_three();

        assert_eq!(topology.all_ports(), vec![7000, 7001, 7002, 7100, 7101, 7102]);
        assert_eq!(topology.meet_target(), 7000);
    }
}
