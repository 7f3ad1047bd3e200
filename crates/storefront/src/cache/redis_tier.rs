//! A cache tier backed by a Redis primary and its replicas.
//!
//! Every storefront process talks to the same Redis deployment, so a write
//! or invalidation in one process is seen by all others. The primary and
//! replicas are resolved through a quorum of Redis Sentinels, each asked
//! with `SENTINEL get-master-addr-by-name` and `SENTINEL replicas`.
//!
//! Layout:
//!
//! - named cache `c`: hash `cache:{c}`, generation counter `cache-generation:{c}`
//! - volatile hashes, sets and leases: the caller's key, unchanged
//!
//! Multi-step operations (conditional fills, zero-removing increments,
//! toggles, lease release) run as Lua scripts so they stay atomic on the
//! primary.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisError, Script};
use tracing::{debug, info, instrument, warn};

use super::discovery::{check_quorum, elect};
use super::{CacheError, CacheName, CacheTier, Consistency, RoutingPolicy, SentinelView, VolatileStore};

/// How long one sentinel or node may take to answer during discovery.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Replica flags that mean a replica should not serve reads.
const UNHEALTHY_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

const FILL_LUA: &str = r"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current ~= tonumber(ARGV[3]) then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
";

const PUT_LUA: &str = r"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return redis.call('INCR', KEYS[2])
";

const EVICT_LUA: &str = r"
redis.call('HDEL', KEYS[1], ARGV[1])
return redis.call('INCR', KEYS[2])
";

const EVICT_ALL_LUA: &str = r"
redis.call('DEL', KEYS[1])
return redis.call('INCR', KEYS[2])
";

const FLUSH_LUA: &str = r"
for i = 1, #KEYS, 2 do
  redis.call('DEL', KEYS[i])
  redis.call('INCR', KEYS[i + 1])
end
return 1
";

const INCREMENT_LUA: &str = r"
local count = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
if count <= 0 then
  redis.call('HDEL', KEYS[1], ARGV[1])
end
return count
";

const TOGGLE_LUA: &str = r"
if redis.call('SREM', KEYS[1], ARGV[1]) == 1 then
  return 0
end
redis.call('SADD', KEYS[1], ARGV[1])
return 1
";

const UNLOCK_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

fn entries_key(cache: CacheName) -> String {
    format!("cache:{cache}")
}

fn generation_key(cache: CacheName) -> String {
    format!("cache-generation:{cache}")
}

/// Turn one entry of `SENTINEL replicas` into an address, skipping replicas
/// the sentinel considers down.
fn healthy_replica(entry: &HashMap<String, String>) -> Option<String> {
    let flags = entry.get("flags").map_or("", String::as_str);
    if flags
        .split(',')
        .any(|flag| UNHEALTHY_FLAGS.contains(&flag.trim()))
    {
        return None;
    }
    let ip = entry.get("ip")?;
    let port = entry.get("port")?;
    Some(format!("{ip}:{port}"))
}

fn node_url(address: &str) -> String {
    format!("redis://{address}/")
}

/// Whether an error suggests the primary moved and the topology is stale.
fn signals_failover(err: &RedisError) -> bool {
    err.kind() == ErrorKind::ReadOnly || err.is_io_error() || err.is_connection_dropped()
}

/// Where to find the sentinels and which service they monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// Sentinel URLs, e.g. `redis://10.0.0.5:26379`.
    pub sentinels: Vec<String>,
    /// The service name the sentinels monitor.
    pub service: String,
    pub quorum: usize,
    pub policy: RoutingPolicy,
}

struct Node {
    address: String,
    conn: MultiplexedConnection,
}

struct Connections {
    primary: Node,
    replicas: Vec<Node>,
}

struct Scripts {
    fill: Script,
    put: Script,
    evict: Script,
    evict_all: Script,
    flush: Script,
    increment: Script,
    toggle: Script,
    unlock: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            fill: Script::new(FILL_LUA),
            put: Script::new(PUT_LUA),
            evict: Script::new(EVICT_LUA),
            evict_all: Script::new(EVICT_ALL_LUA),
            flush: Script::new(FLUSH_LUA),
            increment: Script::new(INCREMENT_LUA),
            toggle: Script::new(TOGGLE_LUA),
            unlock: Script::new(UNLOCK_LUA),
        }
    }
}

struct Inner {
    sentinels: Vec<Client>,
    service: String,
    quorum: usize,
    policy: RoutingPolicy,
    connections: RwLock<Arc<Connections>>,
    cursor: AtomicUsize,
    scripts: Scripts,
}

/// A cache tier shared by every storefront process through Redis.
///
/// Cheap to clone; clones share connections.
#[derive(Clone)]
pub struct RedisCacheTier {
    inner: Arc<Inner>,
}

impl RedisCacheTier {
    /// Resolve the primary through the sentinels and connect to it and to
    /// its healthy replicas.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Discovery` if the quorum is unsatisfiable or not
    /// reached, and `CacheError::Redis` if a sentinel URL is malformed or the
    /// primary cannot be reached.
    #[instrument(skip_all, fields(service = %settings.service))]
    pub async fn connect(settings: RedisSettings) -> Result<Self, CacheError> {
        check_quorum(settings.quorum, settings.sentinels.len())?;
        let sentinels = settings
            .sentinels
            .iter()
            .map(|url| Client::open(url.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let connections =
            Self::resolve(&sentinels, &settings.service, settings.quorum).await?;
        info!(
            primary = connections.primary.address.as_str(),
            replicas = connections.replicas.len(),
            "Connected to Redis cache tier"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                sentinels,
                service: settings.service,
                quorum: settings.quorum,
                policy: settings.policy,
                connections: RwLock::new(Arc::new(connections)),
                cursor: AtomicUsize::new(0),
                scripts: Scripts::new(),
            }),
        })
    }

    /// Ask the sentinels again and swap in the new connections.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails; the previous connections stay.
    pub async fn rediscover(&self) -> Result<(), CacheError> {
        let connections =
            Self::resolve(&self.inner.sentinels, &self.inner.service, self.inner.quorum).await?;
        let mut current = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.primary.address != connections.primary.address {
            warn!(
                from = current.primary.address.as_str(),
                to = connections.primary.address.as_str(),
                "Redis primary changed"
            );
        }
        *current = Arc::new(connections);
        drop(current);
        Ok(())
    }

    /// Re-run discovery every `every` until the runtime shuts down.
    pub fn spawn_refresh(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let tier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = tier.rediscover().await {
                    warn!(error = %e, "Redis topology refresh failed");
                }
            }
        })
    }

    /// Address of the current primary.
    #[must_use]
    pub fn primary_address(&self) -> String {
        self.connections().primary.address.clone()
    }

    async fn observe(sentinel: &Client, service: &str) -> Option<SentinelView> {
        let query = async {
            let mut conn = sentinel.get_multiplexed_async_connection().await?;
            let primary: Option<(String, String)> = redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(service)
                .query_async(&mut conn)
                .await?;
            let replicas: Vec<HashMap<String, String>> = redis::cmd("SENTINEL")
                .arg("replicas")
                .arg(service)
                .query_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(primary.map(|(host, port)| SentinelView {
                primary: format!("{host}:{port}"),
                replicas: replicas.iter().filter_map(healthy_replica).collect(),
            }))
        };
        match tokio::time::timeout(CONNECT_TIMEOUT, query).await {
            Ok(Ok(view)) => view,
            Ok(Err(e)) => {
                warn!(error = %e, "Sentinel query failed");
                None
            }
            Err(_) => {
                warn!("Sentinel did not answer in time");
                None
            }
        }
    }

    async fn open(address: &str) -> Result<Node, CacheError> {
        let client = Client::open(node_url(address))?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Discovery(format!("timed out connecting to {address}")))??;
        Ok(Node {
            address: address.to_owned(),
            conn,
        })
    }

    async fn resolve(
        sentinels: &[Client],
        service: &str,
        quorum: usize,
    ) -> Result<Connections, CacheError> {
        let views: Vec<SentinelView> =
            futures::future::join_all(sentinels.iter().map(|s| Self::observe(s, service)))
                .await
                .into_iter()
                .flatten()
                .collect();
        let election = elect(&views, quorum, sentinels.len())?;

        let primary = Self::open(&election.primary).await?;
        let mut replicas = Vec::with_capacity(election.replicas.len());
        for address in &election.replicas {
            match Self::open(address).await {
                Ok(node) => replicas.push(node),
                Err(e) => warn!(replica = address.as_str(), error = %e, "Skipping unreachable replica"),
            }
        }
        debug!(
            primary = primary.address.as_str(),
            replicas = replicas.len(),
            votes = election.votes,
            "Resolved Redis topology"
        );
        Ok(Connections { primary, replicas })
    }

    fn connections(&self) -> Arc<Connections> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_conn(&self) -> MultiplexedConnection {
        self.connections().primary.conn.clone()
    }

    /// A connection for a read: a rotating replica when the policy allows it,
    /// otherwise the primary.
    fn read_conn(&self, consistency: Consistency) -> (MultiplexedConnection, bool) {
        let connections = self.connections();
        if self.inner.policy.prefers_replica(consistency) && !connections.replicas.is_empty() {
            let slot =
                self.inner.cursor.fetch_add(1, Ordering::Relaxed) % connections.replicas.len();
            if let Some(node) = connections.replicas.get(slot) {
                return (node.conn.clone(), true);
            }
        }
        (connections.primary.conn.clone(), false)
    }

    /// Surface a primary error, scheduling rediscovery when the primary
    /// looks moved. The command is not retried.
    fn primary_failed(&self, err: RedisError) -> CacheError {
        if signals_failover(&err) {
            let tier = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tier.rediscover().await {
                    warn!(error = %e, "Redis rediscovery after a failed write did not succeed");
                }
            });
        }
        CacheError::Redis(err)
    }

    /// Run a read, retrying once on the primary if a replica fails.
    async fn read<T, F, Fut>(&self, consistency: Consistency, run: F) -> Result<T, CacheError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let (conn, on_replica) = self.read_conn(consistency);
        match run(conn).await {
            Ok(value) => Ok(value),
            Err(e) if on_replica => {
                warn!(error = %e, "Replica read failed, falling back to the primary");
                run(self.write_conn()).await.map_err(|e| self.primary_failed(e))
            }
            Err(e) => Err(self.primary_failed(e)),
        }
    }
}

#[async_trait]
impl CacheTier for RedisCacheTier {
    async fn get(&self, cache: CacheName, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let hash = entries_key(cache);
        self.read(Consistency::Relaxed, |mut conn| {
            let hash = hash.clone();
            async move {
                let value: Option<Vec<u8>> = redis::cmd("HGET")
                    .arg(&hash)
                    .arg(key)
                    .query_async(&mut conn)
                    .await?;
                Ok(value)
            }
        })
        .await
    }

    async fn put(&self, cache: CacheName, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let mut conn = self.write_conn();
        let _generation: u64 = self
            .inner
            .scripts
            .put
            .key(entries_key(cache))
            .key(generation_key(cache))
            .arg(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(())
    }

    async fn generation(&self, cache: CacheName) -> Result<u64, CacheError> {
        let mut conn = self.write_conn();
        let generation: Option<u64> = redis::cmd("GET")
            .arg(generation_key(cache))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(generation.unwrap_or(0))
    }

    async fn put_if_generation(
        &self,
        cache: CacheName,
        key: &str,
        value: Vec<u8>,
        generation: u64,
    ) -> Result<bool, CacheError> {
        let mut conn = self.write_conn();
        let stored: i64 = self
            .inner
            .scripts
            .fill
            .key(entries_key(cache))
            .key(generation_key(cache))
            .arg(key)
            .arg(value)
            .arg(generation)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(stored == 1)
    }

    async fn evict(&self, cache: CacheName, key: &str) -> Result<(), CacheError> {
        let mut conn = self.write_conn();
        let _generation: u64 = self
            .inner
            .scripts
            .evict
            .key(entries_key(cache))
            .key(generation_key(cache))
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(())
    }

    async fn evict_all(&self, cache: CacheName) -> Result<(), CacheError> {
        let mut conn = self.write_conn();
        let _generation: u64 = self
            .inner
            .scripts
            .evict_all
            .key(entries_key(cache))
            .key(generation_key(cache))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut conn = self.write_conn();
        let mut invocation = self.inner.scripts.flush.prepare_invoke();
        for cache in CacheName::ALL {
            invocation.key(entries_key(cache)).key(generation_key(cache));
        }
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        info!("Flushed Redis caches");
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.write_conn();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(())
    }
}

#[async_trait]
impl VolatileStore for RedisCacheTier {
    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, CacheError> {
        let mut conn = self.write_conn();
        let count: i64 = self
            .inner
            .scripts
            .increment
            .key(key)
            .arg(field)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(count)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, CacheError> {
        let mut conn = self.write_conn();
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(removed > 0)
    }

    async fn hash_get_all(
        &self,
        key: &str,
        consistency: Consistency,
    ) -> Result<HashMap<String, i64>, CacheError> {
        self.read(consistency, |mut conn| async move {
            let fields: HashMap<String, i64> = redis::cmd("HGETALL")
                .arg(key)
                .query_async(&mut conn)
                .await?;
            Ok(fields)
        })
        .await
    }

    async fn hash_len(&self, key: &str) -> Result<usize, CacheError> {
        self.read(Consistency::Relaxed, |mut conn| async move {
            let len: usize = redis::cmd("HLEN").arg(key).query_async(&mut conn).await?;
            Ok(len)
        })
        .await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.write_conn();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.write_conn();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, CacheError> {
        self.read(Consistency::Relaxed, |mut conn| async move {
            let members: BTreeSet<String> =
                redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
            Ok(members)
        })
        .await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.read(Consistency::Relaxed, |mut conn| async move {
            let present: bool = redis::cmd("SISMEMBER")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await?;
            Ok(present)
        })
        .await
    }

    async fn set_len(&self, key: &str) -> Result<usize, CacheError> {
        self.read(Consistency::Relaxed, |mut conn| async move {
            let len: usize = redis::cmd("SCARD").arg(key).query_async(&mut conn).await?;
            Ok(len)
        })
        .await
    }

    async fn set_toggle(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.write_conn();
        let present: i64 = self
            .inner
            .scripts
            .toggle
            .key(key)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(present == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.write_conn();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(removed > 0)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.write_conn();
        let taken: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(taken.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.write_conn();
        let released: i64 = self
            .inner
            .scripts
            .unlock
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.primary_failed(e))?;
        Ok(released == 1)
    }
}
