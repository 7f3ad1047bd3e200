//! Per-user favorites held in the cache tier as `favorites:{username}` sets.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use shelf_core::{ProductId, Username};

use super::{ProductCache, StoreError};
use crate::cache::VolatileStore;
use crate::cache::keys::favorites_key;
use crate::models::Product;

/// Favorites operations for authenticated users.
#[derive(Clone)]
pub struct FavoritesStore {
    catalog: ProductCache,
    state: Arc<dyn VolatileStore>,
}

impl FavoritesStore {
    #[must_use]
    pub fn new(catalog: ProductCache, state: Arc<dyn VolatileStore>) -> Self {
        Self { catalog, state }
    }

    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    #[instrument(skip(self), fields(username = %username, product_id = %product_id))]
    pub async fn add(&self, username: &Username, product_id: ProductId) -> Result<(), StoreError> {
        self.state
            .set_add(&favorites_key(username), &product_id.to_string())
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    #[instrument(skip(self), fields(username = %username, product_id = %product_id))]
    pub async fn remove(
        &self,
        username: &Username,
        product_id: ProductId,
    ) -> Result<(), StoreError> {
        self.state
            .set_remove(&favorites_key(username), &product_id.to_string())
            .await?;
        Ok(())
    }

    /// Favorite product ids; empty when the user has none.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    pub async fn ids_of(&self, username: &Username) -> Result<BTreeSet<ProductId>, StoreError> {
        let members = self.state.set_members(&favorites_key(username)).await?;
        Ok(members
            .into_iter()
            .filter_map(|member| match member.parse::<ProductId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(member = %member, error = %e, "Skipping malformed favorite");
                    None
                }
            })
            .collect())
    }

    /// Favorite products, hydrated in one lookup.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or tier fails.
    #[instrument(skip(self), fields(username = %username))]
    pub async fn products_of(&self, username: &Username) -> Result<Vec<Product>, StoreError> {
        let ids: Vec<ProductId> = self.ids_of(username).await?.into_iter().collect();
        self.catalog.find_all_by_id(&ids).await
    }

    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    pub async fn count(&self, username: &Username) -> Result<usize, StoreError> {
        Ok(self.state.set_len(&favorites_key(username)).await?)
    }

    /// Whether the product is a favorite.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    pub async fn contains(
        &self,
        username: &Username,
        product_id: ProductId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .state
            .set_contains(&favorites_key(username), &product_id.to_string())
            .await?)
    }

    /// Flip a favorite in one atomic step. Returns `true` if it was added.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    #[instrument(skip(self), fields(username = %username, product_id = %product_id))]
    pub async fn toggle(
        &self,
        username: &Username,
        product_id: ProductId,
    ) -> Result<bool, StoreError> {
        let added = self
            .state
            .set_toggle(&favorites_key(username), &product_id.to_string())
            .await?;
        info!(added, "Favorite toggled");
        Ok(added)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::ReplicatedCacheTier;
    use crate::db::MemoryStore;

    fn favorites() -> FavoritesStore {
        let tier = ReplicatedCacheTier::standalone();
        let catalog = ProductCache::new(Arc::new(MemoryStore::new()), Arc::new(tier.clone()));
        FavoritesStore::new(catalog, Arc::new(tier))
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let favs = favorites();
        let ana = Username::parse("ana").unwrap();
        favs.add(&ana, ProductId::new(3)).await.unwrap();
        favs.add(&ana, ProductId::new(3)).await.unwrap();
        assert_eq!(favs.count(&ana).await.unwrap(), 1);
        assert!(favs.contains(&ana, ProductId::new(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_toggle_twice() {
        let favs = favorites();
        let ana = Username::parse("ana").unwrap();
        assert!(favs.toggle(&ana, ProductId::new(5)).await.unwrap());
        assert_eq!(
            favs.ids_of(&ana).await.unwrap(),
            BTreeSet::from([ProductId::new(5)])
        );
        assert!(!favs.toggle(&ana, ProductId::new(5)).await.unwrap());
        assert!(favs.ids_of(&ana).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_favorites() {
        let favs = favorites();
        let ghost = Username::parse("ghost").unwrap();
        assert!(favs.ids_of(&ghost).await.unwrap().is_empty());
        assert!(favs.products_of(&ghost).await.unwrap().is_empty());
        assert_eq!(favs.count(&ghost).await.unwrap(), 0);
    }
}
