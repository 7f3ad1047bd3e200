//! Storefront core services.
//!
//! # Services
//!
//! - `catalog` - Read-through product caching with write-then-invalidate
//! - `users` - User lookup, registration and admin bootstrap
//! - `cart` - Per-user carts in the cache tier
//! - `favorites` - Per-user favorites in the cache tier
//! - `purchase` - Checkout under a per-user lease lock
//! - `broadcast` - Catalog snapshots pushed to subscribers
//!
//! All services are cheap to clone and share their backends through `Arc`.

pub mod broadcast;
pub mod cart;
pub mod catalog;
mod error;
pub mod favorites;
pub mod locks;
pub mod purchase;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

pub use broadcast::{
    BroadcastTransport, ChannelTransport, PRODUCTS_TOPIC, UpdateBroadcaster, UpdateNotification,
};
pub use cart::{Cart, CartLine, CartStore};
pub use catalog::ProductCache;
pub use error::StoreError;
pub use favorites::FavoritesStore;
pub use locks::{LeaseGuard, LeaseLocks};
pub use purchase::{PurchaseCoordinator, PurchaseReceipt, PurchasedLine};
pub use users::{AdminBootstrap, UserDirectory};

use crate::cache::{CacheTier, VolatileStore};
use crate::db::{ProductRepository, UserRepository};

/// Lease settings for checkout.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    pub ttl: Duration,
    pub wait: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(5_000),
            wait: Duration::from_millis(2_000),
        }
    }
}

/// Every core service wired to one system of record and one cache tier.
#[derive(Clone)]
pub struct Services {
    pub catalog: ProductCache,
    pub users: UserDirectory,
    pub cart: CartStore,
    pub favorites: FavoritesStore,
    pub purchase: PurchaseCoordinator,
    pub broadcaster: UpdateBroadcaster,
    /// In-process transport the broadcaster publishes on.
    pub updates: Arc<ChannelTransport>,
}

impl Services {
    /// Wire every service to `tier`, which serves both the named caches and
    /// the volatile per-user state.
    #[must_use]
    pub fn new<C>(
        products: Arc<dyn ProductRepository>,
        users: Arc<dyn UserRepository>,
        tier: &C,
        locks: LockSettings,
    ) -> Self
    where
        C: CacheTier + VolatileStore + Clone + 'static,
    {
        let cache = Arc::new(tier.clone());
        let catalog = ProductCache::new(Arc::clone(&products), cache.clone());
        let cart = CartStore::new(catalog.clone(), cache.clone());
        let favorites = FavoritesStore::new(catalog.clone(), cache.clone());
        let lease_locks = LeaseLocks::new(cache.clone(), locks.ttl, locks.wait);
        let purchase = PurchaseCoordinator::new(cart.clone(), catalog.clone(), lease_locks);
        let updates = Arc::new(ChannelTransport::new());
        let broadcaster = UpdateBroadcaster::new(products, updates.clone());

        Self {
            catalog,
            users: UserDirectory::new(users, cache),
            cart,
            favorites,
            purchase,
            broadcaster,
            updates,
        }
    }
}
