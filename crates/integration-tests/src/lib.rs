//! Integration tests for Shelf.
//!
//! # Running Tests
//!
//! ```bash
//! # Embedded backends only
//! cargo test -p shelf-integration-tests
//!
//! # Include PostgreSQL-backed tests
//! STOREFRONT_DATABASE_URL=postgres://... cargo test -p shelf-integration-tests -- --ignored
//!
//! # Include Redis-backed tests
//! CACHE_SENTINEL_URLS=redis://127.0.0.1:26379 cargo test -p shelf-integration-tests --test redis -- --ignored
//! ```
//!
//! # Test Categories
//!
//! - `catalog` - Read-through caching and write invalidation
//! - `volatile_state` - Carts and favorites in the cache tier
//! - `purchase` - Checkout, stock and the lease lock
//! - `broadcast` - Catalog snapshots after writes
//! - `cache_tier` - Replication, routing, discovery and flush
//! - `http` - The axum router end to end
//! - `postgres` - `PostgreSQL` repositories (ignored by default)
//! - `redis` - The Redis cache tier behind sentinels (ignored by default)
//!
//! This library holds the shared fixtures.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use shelf_core::{Price, ProductId, Username};
use shelf_storefront::cache::{
    EmbeddedCluster, ReadFrom, ReplicatedCacheTier, ReplicationMode, RoutingPolicy,
};
use shelf_storefront::db::{MemoryStore, ProductRepository, RepositoryError, UserRepository};
use shelf_storefront::models::{Product, ProductDraft};
use shelf_storefront::services::{LockSettings, Services};
use shelf_storefront::state::AppState;

// =============================================================================
// Builders
// =============================================================================

/// A product draft priced in cents.
#[must_use]
pub fn draft(name: &str, cents: i64, stock: i32, category: Option<&str>) -> ProductDraft {
    ProductDraft {
        name: name.to_owned(),
        price: Price::new(Decimal::new(cents, 2)).unwrap(),
        stock,
        category: category.map(str::to_owned),
        image_url: None,
    }
}

#[must_use]
pub fn user(name: &str) -> Username {
    Username::parse(name).unwrap()
}

/// A discovered cluster with `replicas` replicas, three sentinels and quorum two.
#[must_use]
pub fn replicated_tier(
    replicas: usize,
    read_from: ReadFrom,
    mode: ReplicationMode,
) -> (ReplicatedCacheTier, EmbeddedCluster) {
    let cluster = EmbeddedCluster::new(replicas, 3);
    let tier = ReplicatedCacheTier::discover(
        cluster.discovery(2).unwrap(),
        RoutingPolicy::new(read_from),
        mode,
    )
    .unwrap();
    (tier, cluster)
}

/// Lock settings short enough for tests.
#[must_use]
pub const fn test_locks() -> LockSettings {
    LockSettings {
        ttl: Duration::from_secs(5),
        wait: Duration::from_secs(2),
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Services over the embedded store and a cache tier.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub tier: ReplicatedCacheTier,
    pub services: Services,
}

impl Harness {
    /// Embedded store with a single-node tier.
    #[must_use]
    pub fn standalone() -> Self {
        Self::with_tier(ReplicatedCacheTier::standalone())
    }

    /// Embedded store with a synchronously replicated tier and
    /// replica-preferred reads.
    #[must_use]
    pub fn replicated() -> Self {
        let (tier, _cluster) =
            replicated_tier(2, ReadFrom::ReplicaPreferred, ReplicationMode::Synchronous);
        Self::with_tier(tier)
    }

    #[must_use]
    pub fn with_tier(tier: ReplicatedCacheTier) -> Self {
        let store = Arc::new(MemoryStore::new());
        let services = Services::new(store.clone(), store.clone(), &tier, test_locks());
        Self {
            store,
            tier,
            services,
        }
    }

    /// Services whose product reads and writes go through `products`.
    #[must_use]
    pub fn with_products(products: Arc<dyn ProductRepository>) -> Self {
        let tier = ReplicatedCacheTier::standalone();
        let store = Arc::new(MemoryStore::new());
        let users: Arc<dyn UserRepository> = store.clone();
        let services = Services::new(products, users, &tier, test_locks());
        Self {
            store,
            tier,
            services,
        }
    }

    /// Insert a product through the catalog.
    pub async fn product(&self, name: &str, cents: i64, stock: i32) -> Product {
        self.services
            .catalog
            .create(&draft(name, cents, stock, None))
            .await
            .unwrap()
    }

    /// Application state for the HTTP router.
    #[must_use]
    pub fn state(&self) -> AppState {
        AppState::new(self.services.clone(), Arc::new(self.tier.clone()), None)
    }
}

// =============================================================================
// Repository wrappers
// =============================================================================

/// Delegates to an inner repository but fails every stock write (`update` or
/// `adjust_stock`) after the first `allowed_updates`.
pub struct FlakyProducts {
    inner: Arc<dyn ProductRepository>,
    allowed_updates: usize,
    updates: AtomicUsize,
}

impl FlakyProducts {
    #[must_use]
    pub fn new(inner: Arc<dyn ProductRepository>, allowed_updates: usize) -> Self {
        Self {
            inner,
            allowed_updates,
            updates: AtomicUsize::new(0),
        }
    }

    fn fail_after_budget(&self) -> Result<(), RepositoryError> {
        if self.updates.fetch_add(1, Ordering::SeqCst) >= self.allowed_updates {
            return Err(RepositoryError::DataCorruption(
                "connection reset during update".to_owned(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProductRepository for FlakyProducts {
    async fn find_all(&self) -> Result<Vec<Product>, RepositoryError> {
        self.inner.find_all().await
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        self.inner.find_all_by_id(ids).await
    }

    async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, RepositoryError> {
        self.inner.search(name, category).await
    }

    async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, RepositoryError> {
        self.inner.find_distinct_categories().await
    }

    async fn insert(&self, draft: &ProductDraft) -> Result<Product, RepositoryError> {
        self.inner.insert(draft).await
    }

    async fn update(&self, product: &Product) -> Result<Product, RepositoryError> {
        self.fail_after_budget()?;
        self.inner.update(product).await
    }

    async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError> {
        self.fail_after_budget()?;
        self.inner.adjust_stock(id, delta).await
    }

    async fn delete(&self, id: ProductId) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }
}

/// Counts calls that reach the system of record.
pub struct CountingProducts {
    inner: Arc<dyn ProductRepository>,
    pub find_all: AtomicUsize,
    pub find_by_id: AtomicUsize,
    pub find_all_by_id: AtomicUsize,
    pub search: AtomicUsize,
}

impl CountingProducts {
    #[must_use]
    pub fn new(inner: Arc<dyn ProductRepository>) -> Self {
        Self {
            inner,
            find_all: AtomicUsize::new(0),
            find_by_id: AtomicUsize::new(0),
            find_all_by_id: AtomicUsize::new(0),
            search: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductRepository for CountingProducts {
    async fn find_all(&self) -> Result<Vec<Product>, RepositoryError> {
        self.find_all.fetch_add(1, Ordering::SeqCst);
        self.inner.find_all().await
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        self.find_by_id.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_id(id).await
    }

    async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        self.find_all_by_id.fetch_add(1, Ordering::SeqCst);
        self.inner.find_all_by_id(ids).await
    }

    async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, RepositoryError> {
        self.search.fetch_add(1, Ordering::SeqCst);
        self.inner.search(name, category).await
    }

    async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, RepositoryError> {
        self.inner.find_distinct_categories().await
    }

    async fn insert(&self, draft: &ProductDraft) -> Result<Product, RepositoryError> {
        self.inner.insert(draft).await
    }

    async fn update(&self, product: &Product) -> Result<Product, RepositoryError> {
        self.inner.update(product).await
    }

    async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError> {
        self.inner.adjust_stock(id, delta).await
    }

    async fn delete(&self, id: ProductId) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }
}

/// Delegates to an inner repository but reports every stock decrement of
/// `contended` as lost to another buyer.
pub struct ContendedProducts {
    inner: Arc<dyn ProductRepository>,
    contended: ProductId,
}

impl ContendedProducts {
    #[must_use]
    pub fn new(inner: Arc<dyn ProductRepository>, contended: ProductId) -> Self {
        Self { inner, contended }
    }
}

#[async_trait]
impl ProductRepository for ContendedProducts {
    async fn find_all(&self) -> Result<Vec<Product>, RepositoryError> {
        self.inner.find_all().await
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        self.inner.find_all_by_id(ids).await
    }

    async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, RepositoryError> {
        self.inner.search(name, category).await
    }

    async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, RepositoryError> {
        self.inner.find_distinct_categories().await
    }

    async fn insert(&self, draft: &ProductDraft) -> Result<Product, RepositoryError> {
        self.inner.insert(draft).await
    }

    async fn update(&self, product: &Product) -> Result<Product, RepositoryError> {
        self.inner.update(product).await
    }

    async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError> {
        if id == self.contended && delta < 0 {
            return Err(RepositoryError::InsufficientStock);
        }
        self.inner.adjust_stock(id, delta).await
    }

    async fn delete(&self, id: ProductId) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }
}

/// Reads `find_all` from the inner repository, then holds the snapshot for
/// `delay` before returning it, so writes can land in between.
pub struct SlowProducts {
    inner: Arc<dyn ProductRepository>,
    delay: Duration,
}

impl SlowProducts {
    #[must_use]
    pub fn new(inner: Arc<dyn ProductRepository>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ProductRepository for SlowProducts {
    async fn find_all(&self) -> Result<Vec<Product>, RepositoryError> {
        let snapshot = self.inner.find_all().await;
        tokio::time::sleep(self.delay).await;
        snapshot
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        self.inner.find_all_by_id(ids).await
    }

    async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, RepositoryError> {
        self.inner.search(name, category).await
    }

    async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, RepositoryError> {
        self.inner.find_distinct_categories().await
    }

    async fn insert(&self, draft: &ProductDraft) -> Result<Product, RepositoryError> {
        self.inner.insert(draft).await
    }

    async fn update(&self, product: &Product) -> Result<Product, RepositoryError> {
        self.inner.update(product).await
    }

    async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError> {
        self.inner.adjust_stock(id, delta).await
    }

    async fn delete(&self, id: ProductId) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }
}
