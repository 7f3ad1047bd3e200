//! Replicated in-memory cache tier.
//!
//! The tier plays two roles behind one topology of [`MemoryNode`]s:
//!
//! - [`CacheTier`] - named caches of serialized snapshots (products, users).
//!   Entries may be dropped at any time; [`CacheTier::flush`] clears them all.
//! - [`VolatileStore`] - per-user hashes and sets (carts, favorites) plus
//!   lease locks. These are the only copy of that state and survive a flush.
//!
//! # Topology
//!
//! All writes go to the primary and are replicated to every replica, either
//! before the write returns ([`ReplicationMode::Synchronous`]) or through
//! per-replica background queues ([`ReplicationMode::Asynchronous`]). Relaxed
//! reads follow the [`RoutingPolicy`]; with `ReplicaPreferred` they rotate
//! over online replicas and may observe a replica that has not yet applied
//! the latest write. [`Consistency::Strong`] reads always hit the primary.
//!
//! The primary and replicas are located through a [`Discovery`] quorum of
//! sentinels, never from a fixed address.
//!
//! # Backends
//!
//! [`RedisCacheTier`] runs both traits against a Redis primary and replicas
//! found through Redis Sentinel, so every storefront process shares one
//! cache. [`ReplicatedCacheTier`] keeps the same topology in-process for a
//! single instance and for tests.

mod discovery;
mod error;
pub mod json;
pub mod keys;
mod node;
mod redis_tier;
mod replicated;
mod routing;

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;

pub use discovery::{
    Discovery, Election, EmbeddedCluster, LocalSentinel, NodeRegistry, Sentinel, SentinelView, Topology,
};
pub use error::CacheError;
pub use keys::CacheName;
pub use node::{MemoryNode, Mutation};
pub use redis_tier::{RedisCacheTier, RedisSettings};
pub use replicated::{ReplicatedCacheTier, ReplicationMode};
pub use routing::{ReadFrom, RoutingPolicy};

/// Freshness requirement for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Routed by the tier's policy; may be stale under asynchronous replication.
    #[default]
    Relaxed,
    /// Served by the primary.
    Strong,
}

/// Named caches of serialized values.
///
/// Every cache carries a generation that each `put`, eviction and flush
/// advances. A read-through fill captures the generation before reading the
/// system of record and stores its result with [`CacheTier::put_if_generation`],
/// so a snapshot read before a concurrent write can never land after that
/// write's invalidation.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, cache: CacheName, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, cache: CacheName, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    /// Current generation of a cache, read from the primary.
    async fn generation(&self, cache: CacheName) -> Result<u64, CacheError>;

    /// Store `value` only if the cache is still at `generation`.
    ///
    /// Returns `false` when a newer write won and the value was dropped.
    async fn put_if_generation(
        &self,
        cache: CacheName,
        key: &str,
        value: Vec<u8>,
        generation: u64,
    ) -> Result<bool, CacheError>;

    async fn evict(&self, cache: CacheName, key: &str) -> Result<(), CacheError>;

    /// Drop every entry of one cache.
    async fn evict_all(&self, cache: CacheName) -> Result<(), CacheError>;

    /// Drop every entry of every cache. Volatile user state is untouched.
    async fn flush(&self) -> Result<(), CacheError>;

    /// Check that the primary is reachable and accepts writes.
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Per-user hashes and sets, plus lease locks.
///
/// Hash values are counts: an increment that leaves a field at zero or below
/// removes the field, and a hash or set left empty disappears.
#[async_trait]
pub trait VolatileStore: Send + Sync {
    /// Add `delta` to a field and return the resulting count.
    async fn hash_increment(&self, key: &str, field: &str, delta: i64)
    -> Result<i64, CacheError>;

    /// Returns `true` if the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, CacheError>;

    async fn hash_get_all(
        &self,
        key: &str,
        consistency: Consistency,
    ) -> Result<HashMap<String, i64>, CacheError>;

    async fn hash_len(&self, key: &str) -> Result<usize, CacheError>;

    /// Returns `true` if the member was not already present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// Returns `true` if the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, CacheError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn set_len(&self, key: &str) -> Result<usize, CacheError>;

    /// Atomically remove the member if present, otherwise add it.
    ///
    /// Returns `true` if the member is present afterwards.
    async fn set_toggle(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// Remove a whole key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Take the lease `key` for `token` unless another live lease holds it.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Release the lease if `token` still holds it.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError>;
}
