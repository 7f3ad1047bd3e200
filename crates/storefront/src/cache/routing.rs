//! Read and write routing across the topology.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CacheError, Consistency, MemoryNode, Topology};

/// Where relaxed reads are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFrom {
    /// Every read goes to the primary.
    Primary,
    /// Reads rotate over online replicas, falling back to the primary.
    #[default]
    ReplicaPreferred,
}

impl std::str::FromStr for ReadFrom {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(Self::Primary),
            "replica-preferred" | "replica_preferred" => Ok(Self::ReplicaPreferred),
            other => Err(format!(
                "unknown read routing {other:?} (expected primary or replica-preferred)"
            )),
        }
    }
}

/// Routing rules applied by the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingPolicy {
    pub read_from: ReadFrom,
}

impl RoutingPolicy {
    #[must_use]
    pub const fn new(read_from: ReadFrom) -> Self {
        Self { read_from }
    }

    /// Whether a read at `consistency` should be tried on a replica first.
    #[must_use]
    pub fn prefers_replica(&self, consistency: Consistency) -> bool {
        self.read_from == ReadFrom::ReplicaPreferred && consistency == Consistency::Relaxed
    }

    /// Pick the node for a read.
    ///
    /// `cursor` spreads relaxed reads round-robin over online replicas.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::PrimaryUnavailable` if the read must fall back to
    /// a primary that is offline.
    pub fn read_node<'a>(
        &self,
        topology: &'a Topology,
        consistency: Consistency,
        cursor: &AtomicUsize,
    ) -> Result<&'a Arc<MemoryNode>, CacheError> {
        if self.prefers_replica(consistency) {
            let online: Vec<&Arc<MemoryNode>> = topology
                .replicas
                .iter()
                .filter(|node| node.is_online())
                .collect();
            if !online.is_empty() {
                let slot = cursor.fetch_add(1, Ordering::Relaxed) % online.len();
                if let Some(node) = online.get(slot) {
                    return Ok(node);
                }
            }
        }
        Self::write_node(topology)
    }

    /// The node that accepts writes.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::PrimaryUnavailable` if the primary is offline.
    pub fn write_node(topology: &Topology) -> Result<&Arc<MemoryNode>, CacheError> {
        if topology.primary.is_online() {
            Ok(&topology.primary)
        } else {
            Err(CacheError::PrimaryUnavailable)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn topology() -> Topology {
        Topology::new(
            Arc::new(MemoryNode::new("p")),
            vec![Arc::new(MemoryNode::new("r1")), Arc::new(MemoryNode::new("r2"))],
        )
    }

    #[test]
    fn test_parse_read_from() {
        assert_eq!("primary".parse::<ReadFrom>().unwrap(), ReadFrom::Primary);
        assert_eq!(
            "Replica-Preferred".parse::<ReadFrom>().unwrap(),
            ReadFrom::ReplicaPreferred
        );
        assert!("nearest".parse::<ReadFrom>().is_err());
    }

    #[test]
    fn test_replica_preferred_rotates() {
        let topology = topology();
        let policy = RoutingPolicy::new(ReadFrom::ReplicaPreferred);
        let cursor = AtomicUsize::new(0);

        let first = policy.read_node(&topology, Consistency::Relaxed, &cursor).unwrap();
        let second = policy.read_node(&topology, Consistency::Relaxed, &cursor).unwrap();
        assert_eq!(first.name(), "r1");
        assert_eq!(second.name(), "r2");
    }

    #[test]
    fn test_skips_offline_replicas_then_falls_back() {
        let topology = topology();
        let policy = RoutingPolicy::new(ReadFrom::ReplicaPreferred);
        let cursor = AtomicUsize::new(0);

        topology.replicas[0].set_online(false);
        for _ in 0..3 {
            let node = policy.read_node(&topology, Consistency::Relaxed, &cursor).unwrap();
            assert_eq!(node.name(), "r2");
        }

        topology.replicas[1].set_online(false);
        let node = policy.read_node(&topology, Consistency::Relaxed, &cursor).unwrap();
        assert_eq!(node.name(), "p");
    }

    #[test]
    fn test_strong_reads_use_primary() {
        let topology = topology();
        let policy = RoutingPolicy::new(ReadFrom::ReplicaPreferred);
        let cursor = AtomicUsize::new(0);
        let node = policy.read_node(&topology, Consistency::Strong, &cursor).unwrap();
        assert_eq!(node.name(), "p");
    }

    #[test]
    fn test_offline_primary_rejects_writes() {
        let topology = topology();
        topology.primary.set_online(false);
        assert!(matches!(
            RoutingPolicy::write_node(&topology),
            Err(CacheError::PrimaryUnavailable)
        ));
    }
}
