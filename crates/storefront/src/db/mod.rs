//! System of record: durable storage for products and users.
//!
//! Two backends implement the repository traits:
//!
//! - [`products::PgProductRepository`] / [`users::PgUserRepository`] - `PostgreSQL`
//! - [`memory::MemoryStore`] - in-process, used for local runs (`memory://`) and tests
//!
//! # Tables
//!
//! - `shelf.product` - catalog, `stock >= 0` and `price >= 0` enforced by constraints
//! - `shelf.app_user` - login names and password hashes
//! - `shelf.user_role` - role labels per user
//!
//! # Migrations
//!
//! Migrations are stored in `crates/storefront/migrations/` and run via:
//! ```bash
//! cargo run -p shelf-cli -- migrate
//! ```

pub mod memory;
pub mod products;
pub mod users;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use shelf_core::{ProductId, Username};

use crate::models::{NewUser, Product, ProductDraft, User};

pub use memory::MemoryStore;
pub use products::PgProductRepository;
pub use users::PgUserRepository;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data failed domain validation.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Record not found.
    #[error("record not found")]
    NotFound,

    /// Unique constraint violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stock adjustment would leave stock below zero.
    #[error("insufficient stock")]
    InsufficientStock,
}

/// Durable product storage.
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// All products ordered by id.
    async fn find_all(&self) -> Result<Vec<Product>, RepositoryError>;

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError>;

    /// Batched lookup in a single round trip. Unknown ids are skipped.
    async fn find_all_by_id(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError>;

    /// Case-insensitive substring search on name and category.
    ///
    /// An empty filter matches everything, including products without a
    /// category.
    async fn search(&self, name: &str, category: &str) -> Result<Vec<Product>, RepositoryError>;

    /// Distinct non-empty categories.
    async fn find_distinct_categories(&self) -> Result<BTreeSet<String>, RepositoryError>;

    /// Insert a new product and return it with its assigned id.
    async fn insert(&self, draft: &ProductDraft) -> Result<Product, RepositoryError>;

    /// Overwrite an existing product.
    ///
    /// Returns `RepositoryError::NotFound` if no product has this id.
    async fn update(&self, product: &Product) -> Result<Product, RepositoryError>;

    /// Add `delta` to a product's stock in one conditional write and return
    /// the updated product.
    ///
    /// The write only happens if the resulting stock is not negative, so
    /// concurrent decrements can never oversell. Returns
    /// `RepositoryError::InsufficientStock` when it would be, and
    /// `RepositoryError::NotFound` if no product has this id.
    async fn adjust_stock(&self, id: ProductId, delta: i32) -> Result<Product, RepositoryError>;

    /// Returns `RepositoryError::NotFound` if no product has this id.
    async fn delete(&self, id: ProductId) -> Result<(), RepositoryError>;
}

/// Durable user storage.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_username(&self, username: &Username)
    -> Result<Option<User>, RepositoryError>;

    /// Returns `RepositoryError::Conflict` if the username is taken.
    async fn insert(&self, user: &NewUser) -> Result<User, RepositoryError>;
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Escape `%`, `_` and `\` so user input matches literally inside `LIKE`.
#[must_use]
pub fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
