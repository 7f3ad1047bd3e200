//! Typed JSON access to a [`CacheTier`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{CacheError, CacheName, CacheTier};

/// Read and decode a cached value.
///
/// An entry that no longer decodes is evicted and reported as a miss.
///
/// # Errors
///
/// Returns `CacheError` if the tier cannot be reached.
pub async fn get_json<T: DeserializeOwned>(
    tier: &dyn CacheTier,
    cache: CacheName,
    key: &str,
) -> Result<Option<T>, CacheError> {
    let Some(bytes) = tier.get(cache, key).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(cache = %cache, key, error = %e, "Dropping undecodable cache entry");
            tier.evict(cache, key).await?;
            Ok(None)
        }
    }
}

/// Encode and store a value.
///
/// # Errors
///
/// Returns `CacheError` if encoding fails or the tier cannot be reached.
pub async fn put_json<T: Serialize + Sync>(
    tier: &dyn CacheTier,
    cache: CacheName,
    key: &str,
    value: &T,
) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec(value)?;
    tier.put(cache, key, bytes).await
}

/// Encode and store a read-through result if `cache` is still at
/// `generation`. Returns `false` when a newer write invalidated the read.
///
/// # Errors
///
/// Returns `CacheError` if encoding fails or the tier cannot be reached.
pub async fn fill_json<T: Serialize + Sync>(
    tier: &dyn CacheTier,
    cache: CacheName,
    key: &str,
    value: &T,
    generation: u64,
) -> Result<bool, CacheError> {
    let bytes = serde_json::to_vec(value)?;
    let stored = tier.put_if_generation(cache, key, bytes, generation).await?;
    if !stored {
        debug!(cache = %cache, key, "Dropping fill superseded by a newer write");
    }
    Ok(stored)
}
