//! `PostgreSQL` product repository.

use std::collections::BTreeSet;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;

use shelf_core::{Price, ProductId};

use super::{ProductRepository, RepositoryError, escape_like};
use crate::models::{Product, ProductDraft};

/// Row shape of `shelf.product`.
#[derive(sqlx::FromRow)]
struct ProductRow {
    id: ProductId,
    name: String,
    price: Decimal,
    stock: i32,
    category: Option<String>,
    image_url: Option<String>,
}

impl TryFrom<ProductRow> for Product {
    type Error = RepositoryError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let price = Price::new(row.price).map_err(|e| {
            RepositoryError::DataCorruption(format!("invalid price for product {}: {e}", row.id))
        })?;
        if row.stock < 0 {
            return Err(RepositoryError::DataCorruption(format!(
                "negative stock for product {}",
                row.id
            )));
        }
        Ok(Self {
            id: row.id,
            name: row.name,
            price,
            stock: row.stock,
            category: row.category,
            image_url: row.image_url,
        })
    }
}

fn into_products(rows: Vec<ProductRow>) -> Result<Vec<Product>, RepositoryError> {
    rows.into_iter().map(Product::try_from).collect()
}

/// Repository for product database operations.
#[derive(Clone)]
pub struct PgProductRepository {
    pool: PgPool,
}

impl PgProductRepository {
    /// Create a new product repository.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductRepository for PgProductRepository {
    async fn find_all(&self) -> Result<Vec<Product>, RepositoryError> {
        let rows = sqlx::query_as::<_, ProductRow>(
            r"
            SELECT id, name, price, stock, category, image_url
            FROM shelf.product
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        into_products(rows)
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r"
            SELECT id, name, price, stock, category, image_url
            FROM shelf.product
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Product::try_from).transpose()
    }

    async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<i64> = ids.iter().map(ProductId::as_i64).collect();

        let rows = sqlx::query_as::<_, ProductRow>(
            r"
            SELECT id, name, price, stock, category, image_url
            FROM shelf.product
            WHERE id = ANY($1)
            ORDER BY id
            ",
        )
        .bind(raw)
        .fetch_all(&self.pool)
        .await?;

        into_products(rows)
    }

    async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, RepositoryError> {
        let name_pattern = format!("%{}%", escape_like(name));
        let category_pattern = format!("%{}%", escape_like(category));

        let rows = sqlx::query_as::<_, ProductRow>(
            r"
            SELECT id, name, price, stock, category, image_url
            FROM shelf.product
            WHERE name ILIKE $1 ESCAPE '\'
              AND ($2 = '' OR category ILIKE $3 ESCAPE '\')
            ORDER BY id
            ",
        )
        .bind(name_pattern)
        .bind(category)
        .bind(category_pattern)
        .fetch_all(&self.pool)
        .await?;

        into_products(rows)
    }

    async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, RepositoryError> {
        let categories: Vec<String> = sqlx::query_scalar(
            r"
            SELECT DISTINCT category
            FROM shelf.product
            WHERE category IS NOT NULL AND category <> ''
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(categories.into_iter().collect())
    }

    async fn insert(&self, draft: &ProductDraft) -> Result<Product, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r"
            INSERT INTO shelf.product (name, price, stock, category, image_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, price, stock, category, image_url
            ",
        )
        .bind(&draft.name)
        .bind(draft.price.amount())
        .bind(draft.stock)
        .bind(draft.category.as_deref())
        .bind(draft.image_url.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Product::try_from(row)
    }

    async fn update(&self, product: &Product) -> Result<Product, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r"
            UPDATE shelf.product
            SET name = $2, price = $3, stock = $4, category = $5, image_url = $6
            WHERE id = $1
            RETURNING id, name, price, stock, category, image_url
            ",
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(product.price.amount())
        .bind(product.stock)
        .bind(product.category.as_deref())
        .bind(product.image_url.as_deref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::NotFound)?;

        Product::try_from(row)
    }

    async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r"
            UPDATE shelf.product
            SET stock = stock + $2
            WHERE id = $1 AND stock + $2 >= 0
            RETURNING id, name, price, stock, category, image_url
            ",
        )
        .bind(id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Product::try_from(row);
        }

        // No row changed: either the product is gone or stock ran short
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM shelf.product WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Err(exists.map_or(RepositoryError::NotFound, |_| {
            RepositoryError::InsufficientStock
        }))
    }

    async fn delete(&self, id: ProductId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM shelf.product WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
