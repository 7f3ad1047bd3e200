//! Lease locks on the cache tier primary.
//!
//! A lease is taken with a random token and expires after its TTL, so a
//! crashed holder cannot block others forever. Acquisition retries with
//! jittered backoff until the wait budget runs out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheError, VolatileStore};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Issues lease locks with a fixed TTL and wait budget.
#[derive(Clone)]
pub struct LeaseLocks {
    store: Arc<dyn VolatileStore>,
    ttl: Duration,
    wait: Duration,
}

impl LeaseLocks {
    #[must_use]
    pub fn new(store: Arc<dyn VolatileStore>, ttl: Duration, wait: Duration) -> Self {
        Self { store, ttl, wait }
    }

    /// Take the lease `key`, waiting up to the configured budget.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::LockTimeout` if the lease stays held past the
    /// wait budget, or any tier error.
    pub async fn acquire(&self, key: String) -> Result<LeaseGuard, CacheError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.store.try_lock(&key, &token, self.ttl).await? {
                debug!(key = %key, "Lease acquired");
                return Ok(LeaseGuard {
                    store: Arc::clone(&self.store),
                    key,
                    token,
                    released: false,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::LockTimeout(key));
            }
            let jitter = Duration::from_millis(rand::rng().random_range(0..5));
            tokio::time::sleep((backoff + jitter).min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Run `work` while holding the lease `key`, releasing it afterwards
    /// whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the error from `work`, or a lock error if the lease could not
    /// be taken or released.
    pub async fn scoped<T, E, F, Fut>(&self, key: String, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        let guard = self.acquire(key).await?;
        let result = work().await;
        match guard.release().await {
            Ok(()) => result,
            Err(e) if result.is_ok() => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Failed to release lease after error");
                result
            }
        }
    }
}

/// A held lease. Release it with [`LeaseGuard::release`]; dropping it
/// releases in the background.
pub struct LeaseGuard {
    store: Arc<dyn VolatileStore>,
    key: String,
    token: String,
    released: bool,
}

impl LeaseGuard {
    /// # Errors
    ///
    /// Returns a tier error if the primary cannot be reached.
    pub async fn release(mut self) -> Result<(), CacheError> {
        self.released = true;
        let held = self.store.unlock(&self.key, &self.token).await?;
        if !held {
            warn!(key = %self.key, "Lease expired before release");
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Lease dropped outside a runtime; it will expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.unlock(&key, &token).await {
                warn!(key = %key, error = %e, "Background lease release failed");
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::ReplicatedCacheTier;

    fn locks(wait_ms: u64) -> LeaseLocks {
        LeaseLocks::new(
            Arc::new(ReplicatedCacheTier::standalone()),
            Duration::from_secs(5),
            Duration::from_millis(wait_ms),
        )
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = locks(30);
        let _held = locks.acquire("lock:a".to_owned()).await.unwrap();
        assert!(matches!(
            locks.acquire("lock:a".to_owned()).await,
            Err(CacheError::LockTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let locks = locks(30);
        let guard = locks.acquire("lock:a".to_owned()).await.unwrap();
        guard.release().await.unwrap();
        assert!(locks.acquire("lock:a".to_owned()).await.is_ok());
    }

    #[tokio::test]
    async fn test_scoped_releases_on_error() {
        let locks = locks(30);
        let result: Result<(), CacheError> = locks
            .scoped("lock:a".to_owned(), || async {
                Err(CacheError::Discovery("boom".to_owned()))
            })
            .await;
        assert!(result.is_err());
        assert!(locks.acquire("lock:a".to_owned()).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_lease_after_release() {
        let locks = locks(2_000);
        let guard = locks.acquire("lock:a".to_owned()).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("lock:a".to_owned()).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await.unwrap();

        assert!(waiter.await.unwrap());
    }
}
