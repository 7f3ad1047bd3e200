//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::cache::CacheTier;
use crate::services::Services;

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc` and provides access to
/// the core services, the cache tier and, when backed by `PostgreSQL`,
/// the connection pool.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    services: Services,
    cache: Arc<dyn CacheTier>,
    pool: Option<PgPool>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// `pool` is `None` when running on the embedded store.
    #[must_use]
    pub fn new(services: Services, cache: Arc<dyn CacheTier>, pool: Option<PgPool>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                services,
                cache,
                pool,
            }),
        }
    }

    /// Get a reference to the core services.
    #[must_use]
    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Get a reference to the cache tier.
    #[must_use]
    pub fn cache(&self) -> &dyn CacheTier {
        self.inner.cache.as_ref()
    }

    /// Get the database connection pool, if any.
    #[must_use]
    pub fn pool(&self) -> Option<&PgPool> {
        self.inner.pool.as_ref()
    }
}
