//! The cache tier client: routes reads, writes through the primary and
//! replicates to every replica.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::{
    CacheError, CacheName, CacheTier, Consistency, Discovery, MemoryNode, Mutation, RoutingPolicy,
    Topology, VolatileStore,
};

/// When replicas receive a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Replicas apply the write before it returns.
    Synchronous,
    /// Replicas apply the write later, in order, from a background queue.
    #[default]
    Asynchronous,
}

impl std::str::FromStr for ReplicationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "synchronous" => Ok(Self::Synchronous),
            "async" | "asynchronous" => Ok(Self::Asynchronous),
            other => Err(format!(
                "unknown replication mode {other:?} (expected sync or async)"
            )),
        }
    }
}

enum ReplicationMsg {
    Apply(Mutation),
    Barrier(oneshot::Sender<()>),
}

enum ReplicaLink {
    Inline(Arc<MemoryNode>),
    Queued(mpsc::UnboundedSender<ReplicationMsg>),
}

struct Wiring {
    topology: Topology,
    links: Vec<ReplicaLink>,
}

struct Inner {
    wiring: RwLock<Arc<Wiring>>,
    /// Serializes primary writes so replicas receive mutations in the order
    /// the primary applied them.
    write_order: Mutex<()>,
    policy: RoutingPolicy,
    mode: ReplicationMode,
    cursor: AtomicUsize,
    discovery: Option<Discovery>,
}

/// A cache tier backed by a replicated set of [`MemoryNode`]s.
///
/// Cheap to clone; clones share the topology and replication queues.
#[derive(Clone)]
pub struct ReplicatedCacheTier {
    inner: Arc<Inner>,
}

impl ReplicatedCacheTier {
    /// Wire an explicit topology.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Replication` if asynchronous replication is
    /// requested outside a tokio runtime.
    pub fn new(
        topology: Topology,
        policy: RoutingPolicy,
        mode: ReplicationMode,
    ) -> Result<Self, CacheError> {
        Self::build(topology, policy, mode, None)
    }

    /// A single synchronous node with primary reads.
    #[must_use]
    pub fn standalone() -> Self {
        let topology = Topology::standalone(Arc::new(MemoryNode::new("standalone")));
        Self {
            inner: Arc::new(Inner {
                wiring: RwLock::new(Arc::new(Wiring {
                    topology,
                    links: Vec::new(),
                })),
                write_order: Mutex::new(()),
                policy: RoutingPolicy::default(),
                mode: ReplicationMode::Synchronous,
                cursor: AtomicUsize::new(0),
                discovery: None,
            }),
        }
    }

    /// Resolve the topology through sentinels and wire it.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Discovery` if no primary reaches the quorum.
    pub fn discover(
        discovery: Discovery,
        policy: RoutingPolicy,
        mode: ReplicationMode,
    ) -> Result<Self, CacheError> {
        let topology = discovery.resolve()?;
        info!(
            primary = topology.primary.name(),
            replicas = topology.replicas.len(),
            ?mode,
            ?policy,
            "Cache tier connected"
        );
        Self::build(topology, policy, mode, Some(discovery))
    }

    fn build(
        topology: Topology,
        policy: RoutingPolicy,
        mode: ReplicationMode,
        discovery: Option<Discovery>,
    ) -> Result<Self, CacheError> {
        let wiring = wire(topology, mode)?;
        Ok(Self {
            inner: Arc::new(Inner {
                wiring: RwLock::new(Arc::new(wiring)),
                write_order: Mutex::new(()),
                policy,
                mode,
                cursor: AtomicUsize::new(0),
                discovery,
            }),
        })
    }

    /// Ask the sentinels again and rewire if the topology changed.
    ///
    /// Queued mutations for the previous replicas are still delivered.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Discovery` if the tier was not built through
    /// discovery or no primary reaches the quorum.
    #[instrument(skip(self))]
    pub fn rediscover(&self) -> Result<(), CacheError> {
        let discovery = self.inner.discovery.as_ref().ok_or_else(|| {
            CacheError::Discovery("tier was not built from sentinels".to_owned())
        })?;
        let topology = discovery.resolve()?;
        let wiring = wire(topology, self.inner.mode)?;
        info!(
            primary = wiring.topology.primary.name(),
            replicas = wiring.topology.replicas.len(),
            "Cache topology refreshed"
        );
        *self
            .inner
            .wiring
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(wiring);
        Ok(())
    }

    /// The topology currently in use.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.wiring().topology.clone()
    }

    #[must_use]
    pub fn policy(&self) -> RoutingPolicy {
        self.inner.policy
    }

    #[must_use]
    pub fn mode(&self) -> ReplicationMode {
        self.inner.mode
    }

    /// Wait until every replica has applied all writes issued so far.
    pub async fn sync_replicas(&self) {
        let wiring = self.wiring();
        let mut acks = Vec::new();
        for link in &wiring.links {
            if let ReplicaLink::Queued(tx) = link {
                let (ack_tx, ack_rx) = oneshot::channel();
                if tx.send(ReplicationMsg::Barrier(ack_tx)).is_ok() {
                    acks.push(ack_rx);
                }
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    fn wiring(&self) -> Arc<Wiring> {
        Arc::clone(
            &self
                .inner
                .wiring
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn read_node(&self, consistency: Consistency) -> Result<Arc<MemoryNode>, CacheError> {
        let wiring = self.wiring();
        self.inner
            .policy
            .read_node(&wiring.topology, consistency, &self.inner.cursor)
            .cloned()
    }

    /// Run `op` on the primary and replicate the mutation it reports.
    fn write<T>(
        &self,
        op: impl FnOnce(&MemoryNode) -> Result<(T, Option<Mutation>), CacheError>,
    ) -> Result<T, CacheError> {
        let _order = self
            .inner
            .write_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let wiring = self.wiring();
        let primary = RoutingPolicy::write_node(&wiring.topology)?;
        let (result, mutation) = op(primary.as_ref())?;
        if let Some(mutation) = mutation {
            replicate(&wiring, &mutation);
        }
        Ok(result)
    }

    /// Run a cache write on the primary; it always produces a mutation.
    fn apply(&self, op: impl FnOnce(&MemoryNode) -> Mutation) -> Result<(), CacheError> {
        self.write(|primary| Ok(((), Some(op(primary)))))
    }
}

fn wire(topology: Topology, mode: ReplicationMode) -> Result<Wiring, CacheError> {
    let links = match mode {
        ReplicationMode::Synchronous => topology
            .replicas
            .iter()
            .map(|node| ReplicaLink::Inline(Arc::clone(node)))
            .collect(),
        ReplicationMode::Asynchronous => {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                CacheError::Replication(
                    "asynchronous replication requires a tokio runtime".to_owned(),
                )
            })?;
            topology
                .replicas
                .iter()
                .map(|node| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    handle.spawn(replication_worker(Arc::clone(node), rx));
                    ReplicaLink::Queued(tx)
                })
                .collect()
        }
    };
    Ok(Wiring { topology, links })
}

fn replicate(wiring: &Wiring, mutation: &Mutation) {
    for link in &wiring.links {
        match link {
            ReplicaLink::Inline(node) => {
                if let Err(e) = node.apply(mutation) {
                    warn!(replica = node.name(), error = %e, "Replica rejected mutation");
                }
            }
            ReplicaLink::Queued(tx) => {
                if tx.send(ReplicationMsg::Apply(mutation.clone())).is_err() {
                    warn!("Replication queue closed, mutation dropped");
                }
            }
        }
    }
}

async fn replication_worker(node: Arc<MemoryNode>, mut rx: mpsc::UnboundedReceiver<ReplicationMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ReplicationMsg::Apply(mutation) => {
                if let Err(e) = node.apply(&mutation) {
                    warn!(replica = node.name(), error = %e, "Replica rejected mutation");
                }
            }
            ReplicationMsg::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(replica = node.name(), "Replication stream closed");
}

// =============================================================================
// CacheTier
// =============================================================================

#[async_trait]
impl CacheTier for ReplicatedCacheTier {
    async fn get(&self, cache: CacheName, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let node = self.read_node(Consistency::Relaxed)?;
        Ok(node.get(cache, key).map(|value| value.to_vec()))
    }

    async fn put(&self, cache: CacheName, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.apply(|primary| primary.put(cache, key, value.into()))
    }

    async fn generation(&self, cache: CacheName) -> Result<u64, CacheError> {
        Ok(self.read_node(Consistency::Strong)?.generation(cache))
    }

    async fn put_if_generation(
        &self,
        cache: CacheName,
        key: &str,
        value: Vec<u8>,
        generation: u64,
    ) -> Result<bool, CacheError> {
        self.write(|primary| {
            let mutation = primary.put_if_generation(cache, key, value.into(), generation);
            Ok((mutation.is_some(), mutation))
        })
    }

    async fn evict(&self, cache: CacheName, key: &str) -> Result<(), CacheError> {
        self.apply(|primary| primary.evict(cache, key))
    }

    async fn evict_all(&self, cache: CacheName) -> Result<(), CacheError> {
        self.apply(|primary| primary.evict_all(cache))
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.apply(MemoryNode::flush_caches)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        RoutingPolicy::write_node(&self.wiring().topology).map(|_| ())
    }
}

// =============================================================================
// VolatileStore
// =============================================================================

#[async_trait]
impl VolatileStore for ReplicatedCacheTier {
    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, CacheError> {
        self.write(|primary| {
            let (value, mutation) = primary.hash_increment(key, field, delta)?;
            Ok((value, Some(mutation)))
        })
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, CacheError> {
        self.write(|primary| {
            let removed = primary.hash_delete(key, field)?;
            let mutation = removed.then(|| Mutation::HashDelete {
                key: key.to_owned(),
                field: field.to_owned(),
            });
            Ok((removed, mutation))
        })
    }

    async fn hash_get_all(
        &self,
        key: &str,
        consistency: Consistency,
    ) -> Result<HashMap<String, i64>, CacheError> {
        self.read_node(consistency)?.hash_get_all(key)
    }

    async fn hash_len(&self, key: &str) -> Result<usize, CacheError> {
        self.read_node(Consistency::Relaxed)?.hash_len(key)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.write(|primary| {
            let added = primary.set_add(key, member)?;
            let mutation = added.then(|| Mutation::SetAdd {
                key: key.to_owned(),
                member: member.to_owned(),
            });
            Ok((added, mutation))
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.write(|primary| {
            let removed = primary.set_remove(key, member)?;
            let mutation = removed.then(|| Mutation::SetRemove {
                key: key.to_owned(),
                member: member.to_owned(),
            });
            Ok((removed, mutation))
        })
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, CacheError> {
        self.read_node(Consistency::Relaxed)?.set_members(key)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.read_node(Consistency::Relaxed)?
            .set_contains(key, member)
    }

    async fn set_len(&self, key: &str) -> Result<usize, CacheError> {
        self.read_node(Consistency::Relaxed)?.set_len(key)
    }

    async fn set_toggle(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.write(|primary| {
            let (present, mutation) = primary.set_toggle(key, member)?;
            Ok((present, Some(mutation)))
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.write(|primary| {
            let removed = primary.delete(key);
            let mutation = removed.then(|| Mutation::Delete {
                key: key.to_owned(),
            });
            Ok((removed, mutation))
        })
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.write(|primary| Ok((primary.try_lock(key, token, ttl), None)))
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        self.write(|primary| Ok((primary.unlock(key, token), None)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::{EmbeddedCluster, ReadFrom};

    fn replicated(mode: ReplicationMode) -> (ReplicatedCacheTier, EmbeddedCluster) {
        let cluster = EmbeddedCluster::new(2, 3);
        let tier = ReplicatedCacheTier::discover(
            cluster.discovery(2).unwrap(),
            RoutingPolicy::new(ReadFrom::ReplicaPreferred),
            mode,
        )
        .unwrap();
        (tier, cluster)
    }

    #[tokio::test]
    async fn test_standalone_round_trip() {
        let tier = ReplicatedCacheTier::standalone();
        tier.put(CacheName::Users, "ana", b"{}".to_vec()).await.unwrap();
        assert_eq!(
            tier.get(CacheName::Users, "ana").await.unwrap(),
            Some(b"{}".to_vec())
        );
        tier.evict(CacheName::Users, "ana").await.unwrap();
        assert!(tier.get(CacheName::Users, "ana").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_synchronous_replicas_see_writes_immediately() {
        let (tier, cluster) = replicated(ReplicationMode::Synchronous);
        tier.hash_increment("cart:ana", "1", 2).await.unwrap();
        for name in ["cache-1", "cache-2"] {
            let replica = cluster.node(name).unwrap();
            assert_eq!(replica.hash_len("cart:ana").unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_asynchronous_replicas_converge_after_sync() {
        let (tier, cluster) = replicated(ReplicationMode::Asynchronous);
        tier.set_add("favorites:ana", "4").await.unwrap();
        tier.sync_replicas().await;
        for name in ["cache-1", "cache-2"] {
            let replica = cluster.node(name).unwrap();
            assert!(replica.set_contains("favorites:ana", "4").unwrap());
        }
        assert!(tier.set_contains("favorites:ana", "4").await.unwrap());
    }

    #[tokio::test]
    async fn test_strong_read_sees_unreplicated_write() {
        let (tier, cluster) = replicated(ReplicationMode::Asynchronous);
        let replica = cluster.node("cache-1").unwrap();

        tier.hash_increment("cart:ana", "9", 1).await.unwrap();
        assert_eq!(replica.hash_len("cart:ana").unwrap(), 0);

        let strong = tier
            .hash_get_all("cart:ana", Consistency::Strong)
            .await
            .unwrap();
        assert_eq!(strong.get("9"), Some(&1));

        tier.sync_replicas().await;
        assert_eq!(replica.hash_len("cart:ana").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_preserves_volatile_state() {
        let (tier, _cluster) = replicated(ReplicationMode::Synchronous);
        tier.put(CacheName::AllProducts, "all", b"[]".to_vec())
            .await
            .unwrap();
        tier.hash_increment("cart:ana", "1", 1).await.unwrap();

        tier.flush().await.unwrap();

        assert!(tier.get(CacheName::AllProducts, "all").await.unwrap().is_none());
        assert_eq!(tier.hash_len("cart:ana").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conditional_fill_reaches_replicas() {
        let (tier, cluster) = replicated(ReplicationMode::Synchronous);
        let generation = tier.generation(CacheName::AllProducts).await.unwrap();
        assert!(
            tier.put_if_generation(CacheName::AllProducts, "all", b"[1]".to_vec(), generation)
                .await
                .unwrap()
        );
        for name in ["cache-1", "cache-2"] {
            let replica = cluster.node(name).unwrap();
            assert_eq!(replica.get(CacheName::AllProducts, "all").as_deref(), Some(b"[1]".as_slice()));
        }

        tier.evict_all(CacheName::AllProducts).await.unwrap();
        assert!(
            !tier
                .put_if_generation(CacheName::AllProducts, "all", b"[0]".to_vec(), generation)
                .await
                .unwrap()
        );
        assert!(tier.get(CacheName::AllProducts, "all").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ping_tracks_primary() {
        let (tier, cluster) = replicated(ReplicationMode::Synchronous);
        tier.ping().await.unwrap();
        cluster.node("cache-0").unwrap().set_online(false);
        assert!(matches!(tier.ping().await, Err(CacheError::PrimaryUnavailable)));
    }

    #[tokio::test]
    async fn test_rediscover_follows_fail_over() {
        let (tier, cluster) = replicated(ReplicationMode::Synchronous);
        tier.set_add("favorites:ana", "1").await.unwrap();

        cluster.node("cache-0").unwrap().set_online(false);
        assert!(matches!(
            tier.set_add("favorites:ana", "2").await,
            Err(CacheError::PrimaryUnavailable)
        ));

        cluster.fail_over("cache-1");
        tier.rediscover().unwrap();
        assert_eq!(tier.topology().primary.name(), "cache-1");
        assert!(tier.set_add("favorites:ana", "2").await.unwrap());
        assert_eq!(tier.set_len("favorites:ana").await.unwrap(), 2);
    }

    #[test]
    fn test_async_mode_requires_runtime() {
        let topology = Topology::new(
            Arc::new(MemoryNode::new("p")),
            vec![Arc::new(MemoryNode::new("r"))],
        );
        assert!(matches!(
            ReplicatedCacheTier::new(
                topology,
                RoutingPolicy::default(),
                ReplicationMode::Asynchronous
            ),
            Err(CacheError::Replication(_))
        ));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(
            "sync".parse::<ReplicationMode>().unwrap(),
            ReplicationMode::Synchronous
        );
        assert_eq!(
            "ASYNC".parse::<ReplicationMode>().unwrap(),
            ReplicationMode::Asynchronous
        );
        assert!("eventual".parse::<ReplicationMode>().is_err());
    }
}
