//! Sentinel-based topology discovery.
//!
//! Each sentinel reports which node it believes is the primary and which
//! nodes replicate from it. A primary is accepted only when at least
//! `quorum` reachable sentinels name it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::{CacheError, MemoryNode};

/// The resolved primary and its replicas.
#[derive(Debug, Clone)]
pub struct Topology {
    pub primary: Arc<MemoryNode>,
    pub replicas: Vec<Arc<MemoryNode>>,
}

impl Topology {
    #[must_use]
    pub const fn new(primary: Arc<MemoryNode>, replicas: Vec<Arc<MemoryNode>>) -> Self {
        Self { primary, replicas }
    }

    /// A primary with no replicas.
    #[must_use]
    pub const fn standalone(primary: Arc<MemoryNode>) -> Self {
        Self {
            primary,
            replicas: Vec::new(),
        }
    }
}

/// What one sentinel currently observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelView {
    pub primary: String,
    pub replicas: Vec<String>,
}

/// A source of topology observations.
pub trait Sentinel: Send + Sync {
    /// The current view, or `None` if the sentinel is unreachable.
    fn observe(&self) -> Option<SentinelView>;
}

/// A sentinel whose view is set in-process.
#[derive(Debug)]
pub struct LocalSentinel {
    view: RwLock<Option<SentinelView>>,
}

impl LocalSentinel {
    #[must_use]
    pub const fn new(view: SentinelView) -> Self {
        Self {
            view: RwLock::new(Some(view)),
        }
    }

    /// Replace the view; `None` makes the sentinel unreachable.
    pub fn set_view(&self, view: Option<SentinelView>) {
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = view;
    }
}

impl Sentinel for LocalSentinel {
    fn observe(&self) -> Option<SentinelView> {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Nodes addressable by name.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<MemoryNode>>,
}

impl NodeRegistry {
    pub fn register(&mut self, node: Arc<MemoryNode>) {
        self.nodes.insert(node.name().to_owned(), node);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<MemoryNode>> {
        self.nodes.get(name).cloned()
    }
}

/// Quorum discovery over a set of sentinels.
pub struct Discovery {
    sentinels: Vec<Arc<dyn Sentinel>>,
    registry: NodeRegistry,
    quorum: usize,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("sentinels", &self.sentinels.len())
            .field("quorum", &self.quorum)
            .finish_non_exhaustive()
    }
}

/// The outcome of a sentinel vote: the agreed primary and the replicas the
/// agreeing sentinels report for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub primary: String,
    pub replicas: Vec<String>,
    pub votes: usize,
}

/// Reject a quorum that `sentinels` sentinels can never reach.
///
/// # Errors
///
/// Returns `CacheError::Discovery` if `quorum` is zero or larger than the
/// number of sentinels.
pub fn check_quorum(quorum: usize, sentinels: usize) -> Result<(), CacheError> {
    if quorum == 0 || quorum > sentinels {
        return Err(CacheError::Discovery(format!(
            "quorum {quorum} is not satisfiable by {sentinels} sentinels"
        )));
    }
    Ok(())
}

/// Count the views of reachable sentinels and pick the primary that at
/// least `quorum` of them name.
///
/// # Errors
///
/// Returns `CacheError::Discovery` if no primary reaches the quorum or the
/// sentinels are split evenly between primaries.
pub fn elect(views: &[SentinelView], quorum: usize, sentinels: usize) -> Result<Election, CacheError> {
    let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
    for view in views {
        *votes.entry(view.primary.as_str()).or_insert(0) += 1;
    }

    let best = votes.values().copied().max().unwrap_or(0);
    if best < quorum {
        return Err(CacheError::Discovery(format!(
            "no primary reached quorum {quorum} ({best} of {sentinels} sentinels agree)"
        )));
    }
    let leaders: Vec<&str> = votes
        .iter()
        .filter(|(_, count)| **count == best)
        .map(|(name, _)| *name)
        .collect();
    let [primary] = leaders.as_slice() else {
        return Err(CacheError::Discovery(format!(
            "sentinels are split between primaries {leaders:?}"
        )));
    };

    let replicas: BTreeSet<&str> = views
        .iter()
        .filter(|view| view.primary == *primary)
        .flat_map(|view| view.replicas.iter().map(String::as_str))
        .filter(|name| name != primary)
        .collect();

    Ok(Election {
        primary: (*primary).to_owned(),
        replicas: replicas.into_iter().map(str::to_owned).collect(),
        votes: best,
    })
}

impl Discovery {
    /// # Errors
    ///
    /// Returns `CacheError::Discovery` if `quorum` is zero or larger than the
    /// number of sentinels.
    pub fn new(
        sentinels: Vec<Arc<dyn Sentinel>>,
        registry: NodeRegistry,
        quorum: usize,
    ) -> Result<Self, CacheError> {
        check_quorum(quorum, sentinels.len())?;
        Ok(Self {
            sentinels,
            registry,
            quorum,
        })
    }

    /// Ask every sentinel and resolve the agreed topology.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Discovery` if no primary reaches the quorum, if
    /// sentinels are split between primaries, or if the agreed primary is
    /// unknown or offline.
    pub fn resolve(&self) -> Result<Topology, CacheError> {
        let views: Vec<SentinelView> = self
            .sentinels
            .iter()
            .filter_map(|sentinel| sentinel.observe())
            .collect();
        let election = elect(&views, self.quorum, self.sentinels.len())?;

        let primary = self.registry.get(&election.primary).ok_or_else(|| {
            CacheError::Discovery(format!("primary {:?} is not a known node", election.primary))
        })?;
        if !primary.is_online() {
            return Err(CacheError::Discovery(format!(
                "primary {:?} is offline",
                election.primary
            )));
        }

        let replicas = election
            .replicas
            .iter()
            .filter_map(|name| {
                let node = self.registry.get(name);
                if node.is_none() {
                    warn!(replica = name.as_str(), "Sentinel reported an unknown replica");
                }
                node
            })
            .collect::<Vec<_>>();

        debug!(
            primary = primary.name(),
            replicas = replicas.len(),
            votes = election.votes,
            "Resolved cache topology"
        );
        Ok(Topology::new(primary, replicas))
    }
}

/// An in-process cluster: one primary, replicas and sentinels that agree on
/// them. Nodes are named `cache-0` (initial primary), `cache-1`, ...
#[derive(Debug)]
pub struct EmbeddedCluster {
    registry: NodeRegistry,
    names: Vec<String>,
    sentinels: Vec<Arc<LocalSentinel>>,
}

impl EmbeddedCluster {
    #[must_use]
    pub fn new(replicas: usize, sentinels: usize) -> Self {
        let names: Vec<String> = (0..=replicas).map(|i| format!("cache-{i}")).collect();
        let mut registry = NodeRegistry::default();
        for name in &names {
            registry.register(Arc::new(MemoryNode::new(name.clone())));
        }
        let view = Self::view_for(&names, "cache-0");
        let sentinels = (0..sentinels)
            .map(|_| Arc::new(LocalSentinel::new(view.clone())))
            .collect();
        Self {
            registry,
            names,
            sentinels,
        }
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<Arc<MemoryNode>> {
        self.registry.get(name)
    }

    #[must_use]
    pub fn sentinels(&self) -> &[Arc<LocalSentinel>] {
        &self.sentinels
    }

    /// Build a [`Discovery`] over this cluster's sentinels.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Discovery` if the quorum is not satisfiable.
    pub fn discovery(&self, quorum: usize) -> Result<Discovery, CacheError> {
        let sentinels = self
            .sentinels
            .iter()
            .map(|sentinel| Arc::clone(sentinel) as Arc<dyn Sentinel>)
            .collect();
        Discovery::new(sentinels, self.registry.clone(), quorum)
    }

    /// Make every sentinel report `new_primary`, with all other nodes as its
    /// replicas.
    pub fn fail_over(&self, new_primary: &str) {
        let view = Self::view_for(&self.names, new_primary);
        for sentinel in &self.sentinels {
            sentinel.set_view(Some(view.clone()));
        }
    }

    fn view_for(names: &[String], primary: &str) -> SentinelView {
        SentinelView {
            primary: primary.to_owned(),
            replicas: names.iter().filter(|n| *n != primary).cloned().collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_agreed_topology() {
        let cluster = EmbeddedCluster::new(2, 3);
        let topology = cluster.discovery(2).unwrap().resolve().unwrap();
        assert_eq!(topology.primary.name(), "cache-0");
        let names: Vec<&str> = topology.replicas.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["cache-1", "cache-2"]);
    }

    #[test]
    fn test_quorum_survives_one_unreachable_sentinel() {
        let cluster = EmbeddedCluster::new(1, 3);
        cluster.sentinels()[0].set_view(None);
        assert!(cluster.discovery(2).unwrap().resolve().is_ok());
    }

    #[test]
    fn test_below_quorum_fails() {
        let cluster = EmbeddedCluster::new(1, 3);
        cluster.sentinels()[0].set_view(None);
        cluster.sentinels()[1].set_view(None);
        assert!(matches!(
            cluster.discovery(2).unwrap().resolve(),
            Err(CacheError::Discovery(_))
        ));
    }

    #[test]
    fn test_minority_view_is_outvoted() {
        let cluster = EmbeddedCluster::new(2, 3);
        cluster.sentinels()[2].set_view(Some(SentinelView {
            primary: "cache-1".to_owned(),
            replicas: vec![],
        }));
        let topology = cluster.discovery(2).unwrap().resolve().unwrap();
        assert_eq!(topology.primary.name(), "cache-0");
    }

    #[test]
    fn test_fail_over_changes_primary() {
        let cluster = EmbeddedCluster::new(2, 3);
        cluster.fail_over("cache-2");
        let topology = cluster.discovery(2).unwrap().resolve().unwrap();
        assert_eq!(topology.primary.name(), "cache-2");
        assert_eq!(topology.replicas.len(), 2);
    }

    #[test]
    fn test_elect_splits_and_ties() {
        let view = |primary: &str| SentinelView {
            primary: primary.to_owned(),
            replicas: vec!["10.0.0.9:6379".to_owned(), primary.to_owned()],
        };
        let election = elect(&[view("a:6379"), view("a:6379"), view("b:6379")], 2, 3).unwrap();
        assert_eq!(election.primary, "a:6379");
        assert_eq!(election.replicas, vec!["10.0.0.9:6379".to_owned()]);
        assert_eq!(election.votes, 2);

        assert!(elect(&[view("a:6379"), view("b:6379")], 1, 2).is_err());
        assert!(elect(&[], 1, 3).is_err());
    }

    #[test]
    fn test_unsatisfiable_quorum() {
        let cluster = EmbeddedCluster::new(1, 2);
        assert!(cluster.discovery(3).is_err());
        assert!(cluster.discovery(0).is_err());
    }
}
