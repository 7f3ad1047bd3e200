use thiserror::Error;

/// Errors raised by the cache tier.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The primary is offline or unknown; writes cannot proceed.
    #[error("no writable primary available")]
    PrimaryUnavailable,

    /// Sentinels did not agree on a primary.
    #[error("topology discovery failed: {0}")]
    Discovery(String),

    /// The key holds a structure of another kind.
    #[error("key {0:?} holds a value of another type")]
    WrongType(String),

    /// A cached value could not be encoded or decoded.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lease could not be taken within the wait budget.
    #[error("timed out waiting for lock {0:?}")]
    LockTimeout(String),

    /// A Redis node rejected a command or could not be reached.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Replication could not be set up.
    #[error("replication error: {0}")]
    Replication(String),
}
