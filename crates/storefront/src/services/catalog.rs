//! Read-through product caching over the system of record.
//!
//! Reads populate the named caches on a miss. Writes go to the system of
//! record first; only after the durable write succeeds is the `by-id` entry
//! refreshed (or evicted) and every list-shaped cache dropped.
//!
//! A miss reads the cache generation before it reads the system of record
//! and fills only if that generation still holds, so a reader racing a write
//! cannot put back the snapshot the write just invalidated.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use shelf_core::ProductId;

use super::StoreError;
use crate::cache::json::{fill_json, get_json, put_json};
use crate::cache::keys::{self, CacheName};
use crate::cache::CacheTier;
use crate::db::{ProductRepository, RepositoryError};
use crate::models::{Product, ProductDraft};

/// Cache-coherent access to the product catalog.
#[derive(Clone)]
pub struct ProductCache {
    products: Arc<dyn ProductRepository>,
    cache: Arc<dyn CacheTier>,
}

impl ProductCache {
    #[must_use]
    pub fn new(products: Arc<dyn ProductRepository>, cache: Arc<dyn CacheTier>) -> Self {
        Self { products, cache }
    }

    /// All products, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or cache fails.
    #[instrument(skip(self))]
    pub async fn find_all(&self) -> Result<Vec<Product>, StoreError> {
        if let Some(products) = get_json(&*self.cache, CacheName::AllProducts, keys::ALL).await? {
            debug!("Cache hit for product list");
            return Ok(products);
        }
        debug!("Cache miss for product list");
        let generation = self.cache.generation(CacheName::AllProducts).await?;
        let products = self.products.find_all().await?;
        fill_json(&*self.cache, CacheName::AllProducts, keys::ALL, &products, generation).await?;
        Ok(products)
    }

    /// A single product. Absence is not cached.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or cache fails.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let key = id.to_string();
        if let Some(product) = get_json(&*self.cache, CacheName::ProductById, &key).await? {
            debug!("Cache hit for product");
            return Ok(Some(product));
        }
        debug!("Cache miss for product");
        let generation = self.cache.generation(CacheName::ProductById).await?;
        let product = self.products.find_by_id(id).await?;
        if let Some(product) = &product {
            fill_json(&*self.cache, CacheName::ProductById, &key, product, generation).await?;
        }
        Ok(product)
    }

    /// Case-insensitive substring search; an empty filter matches everything.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or cache fails.
    #[instrument(skip(self))]
    pub async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, StoreError> {
        let key = keys::search_key(name, category);
        if let Some(products) = get_json(&*self.cache, CacheName::FilteredProducts, &key).await? {
            debug!("Cache hit for product search");
            return Ok(products);
        }
        debug!("Cache miss for product search");
        let generation = self.cache.generation(CacheName::FilteredProducts).await?;
        let products = self.products.search(name, category).await?;
        fill_json(&*self.cache, CacheName::FilteredProducts, &key, &products, generation).await?;
        Ok(products)
    }

    /// Distinct non-empty categories.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or cache fails.
    #[instrument(skip(self))]
    pub async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, StoreError> {
        if let Some(categories) = get_json(&*self.cache, CacheName::Categories, keys::ALL).await? {
            debug!("Cache hit for categories");
            return Ok(categories);
        }
        debug!("Cache miss for categories");
        let generation = self.cache.generation(CacheName::Categories).await?;
        let categories = self.products.find_distinct_categories().await?;
        fill_json(&*self.cache, CacheName::Categories, keys::ALL, &categories, generation).await?;
        Ok(categories)
    }

    /// Insert a new product.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidArgument` if the draft is invalid, or an
    /// infrastructure error if the store or cache fails.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn create(&self, draft: &ProductDraft) -> Result<Product, StoreError> {
        draft.validate()?;
        let product = self.products.insert(draft).await?;
        info!(product_id = %product.id, "Product created");
        self.refresh(&product).await?;
        Ok(product)
    }

    /// Overwrite an existing product.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidArgument` if the product is invalid,
    /// `StoreError::NotFound` if it does not exist, or an infrastructure error.
    #[instrument(skip(self, product), fields(product_id = %product.id))]
    pub async fn save(&self, product: &Product) -> Result<Product, StoreError> {
        product.validate()?;
        let saved = self
            .products
            .update(product)
            .await
            .map_err(|e| not_found_as(e, product.id))?;
        info!(stock = saved.stock, "Product saved");
        self.refresh(&saved).await?;
        Ok(saved)
    }

    /// Add `delta` to a product's stock as one conditional write in the
    /// system of record, then refresh the caches like [`Self::save`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InsufficientStock` if the stock would drop below
    /// zero, `StoreError::NotFound` if the product does not exist, or an
    /// infrastructure error.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, StoreError> {
        let adjusted = self
            .products
            .adjust_stock(id, delta)
            .await
            .map_err(|e| match e {
                RepositoryError::InsufficientStock => StoreError::InsufficientStock {
                    product: format!("product {id}"),
                },
                other => not_found_as(other, id),
            })?;
        info!(delta, stock = adjusted.stock, "Stock adjusted");
        self.refresh(&adjusted).await?;
        Ok(adjusted)
    }

    /// Delete a product.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if it does not exist, or an
    /// infrastructure error.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn delete_by_id(&self, id: ProductId) -> Result<(), StoreError> {
        self.products
            .delete(id)
            .await
            .map_err(|e| not_found_as(e, id))?;
        info!("Product deleted");
        self.cache
            .evict(CacheName::ProductById, &id.to_string())
            .await?;
        self.evict_lists().await
    }

    /// Uncached lookup straight from the system of record.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store fails.
    pub async fn find_fresh(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.products.find_by_id(id).await?)
    }

    /// Uncached batched lookup in one round trip. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store fails.
    pub async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.products.find_all_by_id(ids).await?)
    }

    async fn refresh(&self, product: &Product) -> Result<(), StoreError> {
        put_json(
            &*self.cache,
            CacheName::ProductById,
            &product.id.to_string(),
            product,
        )
        .await?;
        self.evict_lists().await
    }

    async fn evict_lists(&self) -> Result<(), StoreError> {
        for cache in CacheName::PRODUCT_LISTS {
            self.cache.evict_all(cache).await?;
        }
        Ok(())
    }
}

fn not_found_as(err: RepositoryError, id: ProductId) -> StoreError {
    match err {
        RepositoryError::NotFound => StoreError::NotFound(format!("product {id}")),
        other => StoreError::Repository(other),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;
    use shelf_core::Price;

    use super::*;
    use crate::cache::ReplicatedCacheTier;
    use crate::db::MemoryStore;

    fn draft(name: &str, stock: i32) -> ProductDraft {
        ProductDraft {
            name: name.to_owned(),
            price: Price::new(Decimal::new(999, 2)).unwrap(),
            stock,
            category: Some("tools".to_owned()),
            image_url: None,
        }
    }

    fn catalog() -> (ProductCache, Arc<MemoryStore>, ReplicatedCacheTier) {
        let store = Arc::new(MemoryStore::new());
        let tier = ReplicatedCacheTier::standalone();
        let cache = ProductCache::new(store.clone(), Arc::new(tier.clone()));
        (cache, store, tier)
    }

    #[tokio::test]
    async fn test_save_then_find_returns_saved_value() {
        let (catalog, _, _) = catalog();
        let mut widget = catalog.create(&draft("Widget", 5)).await.unwrap();

        assert_eq!(catalog.find_by_id(widget.id).await.unwrap().unwrap().stock, 5);

        widget.stock = 2;
        catalog.save(&widget).await.unwrap();
        assert_eq!(catalog.find_by_id(widget.id).await.unwrap(), Some(widget));
    }

    #[tokio::test]
    async fn test_list_caches_invalidated_on_write() {
        let (catalog, _, tier) = catalog();
        catalog.create(&draft("Widget", 5)).await.unwrap();
        assert_eq!(catalog.find_all().await.unwrap().len(), 1);
        assert_eq!(catalog.search("", "").await.unwrap().len(), 1);

        catalog.create(&draft("Gadget", 1)).await.unwrap();
        let primary = tier.topology().primary;
        assert_eq!(primary.cached_len(CacheName::AllProducts), 0);
        assert_eq!(primary.cached_len(CacheName::FilteredProducts), 0);
        assert_eq!(catalog.find_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_absence_is_not_cached() {
        let (catalog, store, tier) = catalog();
        assert!(catalog.find_by_id(ProductId::new(1)).await.unwrap().is_none());
        assert_eq!(tier.topology().primary.cached_len(CacheName::ProductById), 0);

        ProductRepository::insert(&*store, &draft("Late", 1)).await.unwrap();
        assert!(catalog.find_by_id(ProductId::new(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let (catalog, _, tier) = catalog();
        catalog.create(&draft("Widget", 5)).await.unwrap();
        catalog.find_all().await.unwrap();

        let ghost = Product::from_draft(ProductId::new(99), draft("Ghost", 1));
        assert!(matches!(
            catalog.save(&ghost).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            catalog.delete_by_id(ProductId::new(99)).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(tier.topology().primary.cached_len(CacheName::AllProducts), 1);
    }

    #[tokio::test]
    async fn test_invalid_product_rejected_before_write() {
        let (catalog, store, _) = catalog();
        assert!(matches!(
            catalog.create(&draft("", 1)).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(store.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adjust_stock_refreshes_caches() {
        let (catalog, _, _) = catalog();
        let widget = catalog.create(&draft("Widget", 5)).await.unwrap();
        catalog.find_all().await.unwrap();

        assert_eq!(catalog.adjust_stock(widget.id, -3).await.unwrap().stock, 2);
        assert_eq!(catalog.find_by_id(widget.id).await.unwrap().unwrap().stock, 2);
        assert_eq!(catalog.find_all().await.unwrap()[0].stock, 2);

        assert!(matches!(
            catalog.adjust_stock(widget.id, -3).await,
            Err(StoreError::InsufficientStock { .. })
        ));
        assert!(matches!(
            catalog.adjust_stock(ProductId::new(99), -1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_evicts_by_id() {
        let (catalog, _, _) = catalog();
        let widget = catalog.create(&draft("Widget", 5)).await.unwrap();
        catalog.find_by_id(widget.id).await.unwrap();

        catalog.delete_by_id(widget.id).await.unwrap();
        assert!(catalog.find_by_id(widget.id).await.unwrap().is_none());
    }
}
