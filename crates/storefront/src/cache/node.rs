//! A single cache node.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{CacheError, CacheName};

/// A state change shipped from the primary to its replicas.
///
/// Mutations carry resulting values rather than operations, so applying one
/// twice leaves a replica in the same state. Cache writes carry the
/// generation the primary assigned; a node never moves a generation back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put {
        cache: CacheName,
        key: String,
        value: Arc<[u8]>,
        generation: u64,
    },
    /// A read-through fill accepted by the primary; leaves the generation alone.
    Fill {
        cache: CacheName,
        key: String,
        value: Arc<[u8]>,
    },
    Evict {
        cache: CacheName,
        key: String,
        generation: u64,
    },
    EvictAll {
        cache: CacheName,
        generation: u64,
    },
    /// Clear every cache and raise all of them to `generation`.
    FlushCaches {
        generation: u64,
    },
    HashSet {
        key: String,
        field: String,
        value: i64,
    },
    HashDelete {
        key: String,
        field: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    Delete {
        key: String,
    },
}

/// Entries of one named cache and the generation of its last write.
#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    entries: HashMap<String, Arc<[u8]>>,
}

impl CacheSlot {
    fn raise(&mut self, generation: u64) {
        self.generation = self.generation.max(generation);
    }
}

#[derive(Debug, Clone)]
enum Structure {
    Hash(HashMap<String, i64>),
    Set(BTreeSet<String>),
}

impl Structure {
    fn is_empty(&self) -> bool {
        match self {
            Self::Hash(hash) => hash.is_empty(),
            Self::Set(set) => set.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// One in-memory node: named caches, a keyspace of hashes and sets, and
/// lease locks.
///
/// Leases are held only by the node that granted them and are not replicated.
#[derive(Debug)]
pub struct MemoryNode {
    name: String,
    online: AtomicBool,
    caches: DashMap<CacheName, CacheSlot>,
    keyspace: DashMap<String, Structure>,
    leases: DashMap<String, Lease>,
}

impl MemoryNode {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            online: AtomicBool::new(true),
            caches: DashMap::new(),
            keyspace: DashMap::new(),
            leases: DashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Mark the node reachable or unreachable for routing.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    // =========================================================================
    // Named caches
    // =========================================================================

    #[must_use]
    pub fn get(&self, cache: CacheName, key: &str) -> Option<Arc<[u8]>> {
        self.caches
            .get(&cache)
            .and_then(|slot| slot.entries.get(key).cloned())
    }

    /// Number of entries held in one cache.
    #[must_use]
    pub fn cached_len(&self, cache: CacheName) -> usize {
        self.caches.get(&cache).map_or(0, |slot| slot.entries.len())
    }

    /// Generation of one cache: raised by every put, eviction and flush.
    #[must_use]
    pub fn generation(&self, cache: CacheName) -> u64 {
        self.caches.get(&cache).map_or(0, |slot| slot.generation)
    }

    /// Store a value unconditionally, advancing the cache's generation.
    pub fn put(&self, cache: CacheName, key: &str, value: Arc<[u8]>) -> Mutation {
        let mut slot = self.caches.entry(cache).or_default();
        slot.generation += 1;
        slot.entries.insert(key.to_owned(), Arc::clone(&value));
        Mutation::Put {
            cache,
            key: key.to_owned(),
            value,
            generation: slot.generation,
        }
    }

    /// Store a value only if the cache is still at `generation`.
    ///
    /// Returns the mutation to replicate, or `None` if a write got there
    /// first and the value was dropped.
    pub fn put_if_generation(
        &self,
        cache: CacheName,
        key: &str,
        value: Arc<[u8]>,
        generation: u64,
    ) -> Option<Mutation> {
        let mut slot = self.caches.entry(cache).or_default();
        if slot.generation != generation {
            return None;
        }
        slot.entries.insert(key.to_owned(), Arc::clone(&value));
        Some(Mutation::Fill {
            cache,
            key: key.to_owned(),
            value,
        })
    }

    pub fn evict(&self, cache: CacheName, key: &str) -> Mutation {
        let mut slot = self.caches.entry(cache).or_default();
        slot.generation += 1;
        slot.entries.remove(key);
        Mutation::Evict {
            cache,
            key: key.to_owned(),
            generation: slot.generation,
        }
    }

    pub fn evict_all(&self, cache: CacheName) -> Mutation {
        let mut slot = self.caches.entry(cache).or_default();
        slot.generation += 1;
        slot.entries.clear();
        Mutation::EvictAll {
            cache,
            generation: slot.generation,
        }
    }

    /// Clear every cache. All of them move past the highest generation held.
    pub fn flush_caches(&self) -> Mutation {
        let generation = CacheName::ALL
            .iter()
            .map(|cache| self.generation(*cache))
            .max()
            .unwrap_or(0)
            + 1;
        self.clear_caches(generation);
        Mutation::FlushCaches { generation }
    }

    fn clear_caches(&self, generation: u64) {
        for cache in CacheName::ALL {
            let mut slot = self.caches.entry(cache).or_default();
            slot.entries.clear();
            slot.raise(generation);
        }
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Apply a mutation as-is.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds another structure.
    pub fn apply(&self, mutation: &Mutation) -> Result<(), CacheError> {
        match mutation {
            Mutation::Put {
                cache,
                key,
                value,
                generation,
            } => {
                let mut slot = self.caches.entry(*cache).or_default();
                slot.entries.insert(key.clone(), Arc::clone(value));
                slot.raise(*generation);
            }
            Mutation::Fill { cache, key, value } => {
                self.caches
                    .entry(*cache)
                    .or_default()
                    .entries
                    .insert(key.clone(), Arc::clone(value));
            }
            Mutation::Evict {
                cache,
                key,
                generation,
            } => {
                let mut slot = self.caches.entry(*cache).or_default();
                slot.entries.remove(key);
                slot.raise(*generation);
            }
            Mutation::EvictAll { cache, generation } => {
                let mut slot = self.caches.entry(*cache).or_default();
                slot.entries.clear();
                slot.raise(*generation);
            }
            Mutation::FlushCaches { generation } => self.clear_caches(*generation),
            Mutation::HashSet { key, field, value } => {
                self.with_hash(key, |hash| {
                    if *value > 0 {
                        hash.insert(field.clone(), *value);
                    } else {
                        hash.remove(field);
                    }
                })?;
            }
            Mutation::HashDelete { key, field } => {
                self.with_hash(key, |hash| hash.remove(field))?;
            }
            Mutation::SetAdd { key, member } => {
                self.with_set(key, |set| set.insert(member.clone()))?;
            }
            Mutation::SetRemove { key, member } => {
                self.with_set(key, |set| set.remove(member))?;
            }
            Mutation::Delete { key } => {
                self.keyspace.remove(key);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    /// Add `delta` to a field, removing it when the count drops to zero or
    /// below. Returns the new count and the mutation to replicate.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a set.
    pub fn hash_increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<(i64, Mutation), CacheError> {
        self.with_hash(key, |hash| {
            let value = hash.get(field).copied().unwrap_or(0).saturating_add(delta);
            if value > 0 {
                hash.insert(field.to_owned(), value);
                let mutation = Mutation::HashSet {
                    key: key.to_owned(),
                    field: field.to_owned(),
                    value,
                };
                (value, mutation)
            } else {
                hash.remove(field);
                let mutation = Mutation::HashDelete {
                    key: key.to_owned(),
                    field: field.to_owned(),
                };
                (value, mutation)
            }
        })
    }

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a set.
    pub fn hash_delete(&self, key: &str, field: &str) -> Result<bool, CacheError> {
        self.with_hash(key, |hash| hash.remove(field).is_some())
    }

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a set.
    pub fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, CacheError> {
        match self.keyspace.get(key).as_deref() {
            None => Ok(HashMap::new()),
            Some(Structure::Hash(hash)) => Ok(hash.clone()),
            Some(Structure::Set(_)) => Err(CacheError::WrongType(key.to_owned())),
        }
    }

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a set.
    pub fn hash_len(&self, key: &str) -> Result<usize, CacheError> {
        match self.keyspace.get(key).as_deref() {
            None => Ok(0),
            Some(Structure::Hash(hash)) => Ok(hash.len()),
            Some(Structure::Set(_)) => Err(CacheError::WrongType(key.to_owned())),
        }
    }

    // =========================================================================
    // Sets
    // =========================================================================

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a hash.
    pub fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.with_set(key, |set| set.insert(member.to_owned()))
    }

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a hash.
    pub fn set_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.with_set(key, |set| set.remove(member))
    }

    /// Flip membership in one step. Returns whether the member is present
    /// afterwards and the mutation to replicate.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a hash.
    pub fn set_toggle(&self, key: &str, member: &str) -> Result<(bool, Mutation), CacheError> {
        self.with_set(key, |set| {
            if set.remove(member) {
                let mutation = Mutation::SetRemove {
                    key: key.to_owned(),
                    member: member.to_owned(),
                };
                (false, mutation)
            } else {
                set.insert(member.to_owned());
                let mutation = Mutation::SetAdd {
                    key: key.to_owned(),
                    member: member.to_owned(),
                };
                (true, mutation)
            }
        })
    }

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a hash.
    pub fn set_members(&self, key: &str) -> Result<BTreeSet<String>, CacheError> {
        match self.keyspace.get(key).as_deref() {
            None => Ok(BTreeSet::new()),
            Some(Structure::Set(set)) => Ok(set.clone()),
            Some(Structure::Hash(_)) => Err(CacheError::WrongType(key.to_owned())),
        }
    }

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a hash.
    pub fn set_contains(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        match self.keyspace.get(key).as_deref() {
            None => Ok(false),
            Some(Structure::Set(set)) => Ok(set.contains(member)),
            Some(Structure::Hash(_)) => Err(CacheError::WrongType(key.to_owned())),
        }
    }

    /// # Errors
    ///
    /// Returns `CacheError::WrongType` if the key holds a hash.
    pub fn set_len(&self, key: &str) -> Result<usize, CacheError> {
        match self.keyspace.get(key).as_deref() {
            None => Ok(0),
            Some(Structure::Set(set)) => Ok(set.len()),
            Some(Structure::Hash(_)) => Err(CacheError::WrongType(key.to_owned())),
        }
    }

    /// Remove a key of any kind.
    #[must_use]
    pub fn delete(&self, key: &str) -> bool {
        self.keyspace.remove(key).is_some()
    }

    // =========================================================================
    // Leases
    // =========================================================================

    /// Grant the lease unless a live lease with another token holds it.
    #[must_use]
    pub fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let lease = Lease {
            token: token.to_owned(),
            expires_at: now + ttl,
        };
        match self.leases.entry(key.to_owned()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now || held.get().token == token {
                    held.insert(lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
                true
            }
        }
    }

    #[must_use]
    pub fn unlock(&self, key: &str, token: &str) -> bool {
        self.leases
            .remove_if(key, |_, lease| lease.token == token)
            .is_some()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run `f` on the hash at `key` while holding its shard lock, creating the
    /// hash if absent and removing it if left empty.
    fn with_hash<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, i64>) -> T,
    ) -> Result<T, CacheError> {
        let mut entry = self
            .keyspace
            .entry(key.to_owned())
            .or_insert_with(|| Structure::Hash(HashMap::new()));
        let Structure::Hash(hash) = entry.value_mut() else {
            return Err(CacheError::WrongType(key.to_owned()));
        };
        let result = f(hash);
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.keyspace.remove_if(key, |_, structure| structure.is_empty());
        }
        Ok(result)
    }

    fn with_set<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut BTreeSet<String>) -> T,
    ) -> Result<T, CacheError> {
        let mut entry = self
            .keyspace
            .entry(key.to_owned())
            .or_insert_with(|| Structure::Set(BTreeSet::new()));
        let Structure::Set(set) = entry.value_mut() else {
            return Err(CacheError::WrongType(key.to_owned()));
        };
        let result = f(set);
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.keyspace.remove_if(key, |_, structure| structure.is_empty());
        }
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_accumulates() {
        let node = MemoryNode::new("n");
        assert_eq!(node.hash_increment("cart:a", "1", 2).unwrap().0, 2);
        assert_eq!(node.hash_increment("cart:a", "1", 3).unwrap().0, 5);
        assert_eq!(node.hash_len("cart:a").unwrap(), 1);
    }

    #[test]
    fn test_decrement_to_zero_removes_field_and_key() {
        let node = MemoryNode::new("n");
        node.hash_increment("cart:a", "1", 2).unwrap();
        let (value, mutation) = node.hash_increment("cart:a", "1", -2).unwrap();
        assert_eq!(value, 0);
        assert!(matches!(mutation, Mutation::HashDelete { .. }));
        assert!(node.hash_get_all("cart:a").unwrap().is_empty());
        assert!(!node.delete("cart:a"));
    }

    #[test]
    fn test_toggle_flips_membership() {
        let node = MemoryNode::new("n");
        assert!(node.set_toggle("fav:a", "3").unwrap().0);
        assert!(node.set_contains("fav:a", "3").unwrap());
        assert!(!node.set_toggle("fav:a", "3").unwrap().0);
        assert_eq!(node.set_len("fav:a").unwrap(), 0);
    }

    #[test]
    fn test_wrong_type() {
        let node = MemoryNode::new("n");
        node.set_add("k", "x").unwrap();
        assert!(matches!(
            node.hash_increment("k", "1", 1),
            Err(CacheError::WrongType(_))
        ));
        assert!(matches!(node.hash_len("k"), Err(CacheError::WrongType(_))));
        assert!(node.set_contains("k", "x").unwrap());
    }

    #[test]
    fn test_replica_converges_from_mutations() {
        let primary = MemoryNode::new("p");
        let replica = MemoryNode::new("r");

        let (_, m1) = primary.hash_increment("cart:a", "7", 4).unwrap();
        let (_, m2) = primary.set_toggle("fav:a", "7").unwrap();
        replica.apply(&m1).unwrap();
        replica.apply(&m2).unwrap();
        replica.apply(&m1).unwrap();

        assert_eq!(replica.hash_get_all("cart:a").unwrap().get("7"), Some(&4));
        assert!(replica.set_contains("fav:a", "7").unwrap());
    }

    #[test]
    fn test_flush_keeps_keyspace() {
        let node = MemoryNode::new("n");
        node.put(CacheName::AllProducts, "all", Arc::from(b"[]".as_slice()));
        node.hash_increment("cart:a", "1", 1).unwrap();

        node.flush_caches();

        assert!(node.get(CacheName::AllProducts, "all").is_none());
        assert_eq!(node.hash_len("cart:a").unwrap(), 1);
    }

    #[test]
    fn test_fill_is_dropped_after_a_newer_write() {
        let node = MemoryNode::new("n");
        let seen = node.generation(CacheName::AllProducts);
        node.evict_all(CacheName::AllProducts);

        let stale = node.put_if_generation(
            CacheName::AllProducts,
            "all",
            Arc::from(b"[old]".as_slice()),
            seen,
        );
        assert!(stale.is_none());
        assert!(node.get(CacheName::AllProducts, "all").is_none());

        let current = node.generation(CacheName::AllProducts);
        let fill = node.put_if_generation(
            CacheName::AllProducts,
            "all",
            Arc::from(b"[new]".as_slice()),
            current,
        );
        assert!(matches!(fill, Some(Mutation::Fill { .. })));
        assert_eq!(node.generation(CacheName::AllProducts), current);
    }

    #[test]
    fn test_replayed_cache_mutations_keep_generation() {
        let primary = MemoryNode::new("p");
        let replica = MemoryNode::new("r");
        let put = primary.put(CacheName::Users, "ana", Arc::from(b"{}".as_slice()));
        let evict = primary.evict(CacheName::Users, "bob");

        for mutation in [&put, &evict, &evict, &put] {
            replica.apply(mutation).unwrap();
        }
        assert_eq!(
            replica.generation(CacheName::Users),
            primary.generation(CacheName::Users)
        );
        assert_eq!(
            replica.get(CacheName::Users, "ana").as_deref(),
            Some(b"{}".as_slice())
        );

        let flush = primary.flush_caches();
        replica.apply(&flush).unwrap();
        replica.apply(&flush).unwrap();
        assert!(replica.get(CacheName::Users, "ana").is_none());
        assert_eq!(
            replica.generation(CacheName::Categories),
            primary.generation(CacheName::Categories)
        );
    }

    #[test]
    fn test_lease_excludes_other_tokens_until_expiry() {
        let node = MemoryNode::new("n");
        assert!(node.try_lock("lock:a", "t1", Duration::from_secs(30)));
        assert!(!node.try_lock("lock:a", "t2", Duration::from_secs(30)));
        assert!(!node.unlock("lock:a", "t2"));
        assert!(node.unlock("lock:a", "t1"));
        assert!(node.try_lock("lock:a", "t2", Duration::from_secs(30)));
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let node = MemoryNode::new("n");
        assert!(node.try_lock("lock:a", "t1", Duration::ZERO));
        assert!(node.try_lock("lock:a", "t2", Duration::from_secs(30)));
    }
}
