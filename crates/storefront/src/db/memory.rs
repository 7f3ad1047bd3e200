//! In-process system of record.
//!
//! Selected with `STOREFRONT_DATABASE_URL=memory://`. Semantics match the
//! `PostgreSQL` repositories: ids are assigned in increasing order, searches
//! are case-insensitive substring matches and usernames are unique.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use shelf_core::{ProductId, UserId, Username};

use super::{ProductRepository, RepositoryError, UserRepository};
use crate::models::{NewUser, Product, ProductDraft, User};

#[derive(Default)]
struct Tables {
    products: BTreeMap<ProductId, Product>,
    users: BTreeMap<Username, User>,
    next_product_id: i64,
    next_user_id: i64,
}

/// Products and users held in memory behind a single lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    needle.is_empty() || haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl ProductRepository for MemoryStore {
    async fn find_all(&self) -> Result<Vec<Product>, RepositoryError> {
        Ok(self.tables.read().await.products.values().cloned().collect())
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        Ok(self.tables.read().await.products.get(&id).cloned())
    }

    async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        let wanted: BTreeSet<ProductId> = ids.iter().copied().collect();
        let tables = self.tables.read().await;
        Ok(wanted
            .iter()
            .filter_map(|id| tables.products.get(id).cloned())
            .collect())
    }

    async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .products
            .values()
            .filter(|p| contains_ignore_case(&p.name, name))
            .filter(|p| {
                category.is_empty()
                    || p.category
                        .as_deref()
                        .is_some_and(|c| contains_ignore_case(c, category))
            })
            .cloned()
            .collect())
    }

    async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .products
            .values()
            .filter_map(|p| p.category.clone())
            .filter(|c| !c.is_empty())
            .collect())
    }

    async fn insert(&self, draft: &ProductDraft) -> Result<Product, RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.next_product_id += 1;
        let product = Product::from_draft(ProductId::new(tables.next_product_id), draft.clone());
        tables.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn update(&self, product: &Product) -> Result<Product, RepositoryError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .products
            .get_mut(&product.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = product.clone();
        Ok(product.clone())
    }

    async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError> {
        let mut tables = self.tables.write().await;
        let product = tables
            .products
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        let stock = product
            .stock
            .checked_add(delta)
            .filter(|stock| *stock >= 0)
            .ok_or(RepositoryError::InsufficientStock)?;
        product.stock = stock;
        Ok(product.clone())
    }

    async fn delete(&self, id: ProductId) -> Result<(), RepositoryError> {
        self.tables
            .write()
            .await
            .products
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_username(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError> {
        Ok(self.tables.read().await.users.get(username).cloned())
    }

    async fn insert(&self, user: &NewUser) -> Result<User, RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.users.contains_key(&user.username) {
            return Err(RepositoryError::Conflict(
                "username already exists".to_owned(),
            ));
        }
        tables.next_user_id += 1;
        let stored = User {
            id: UserId::new(tables.next_user_id),
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            roles: user.roles.clone(),
        };
        tables.users.insert(stored.username.clone(), stored.clone());
        Ok(stored)
    }
}
