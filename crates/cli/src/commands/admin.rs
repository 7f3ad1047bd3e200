//! Admin user management commands.
//!
//! # Usage
//!
//! ```bash
//! shelf-cli admin create -u admin -p 'a-long-random-password'
//! ```
//!
//! # Environment Variables
//!
//! - `STOREFRONT_DATABASE_URL` (or `DATABASE_URL`) - `PostgreSQL` connection string
//! - `STOREFRONT_ADMIN_PASSWORD` - Used when `--password` is omitted

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use shelf_core::{UserId, Username};
use shelf_storefront::cache::ReplicatedCacheTier;
use shelf_storefront::db::{self, PgUserRepository};
use shelf_storefront::services::{AdminBootstrap, StoreError, UserDirectory};

/// Errors that can occur during admin operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// Database connection error.
    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid username.
    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    /// User already exists.
    #[error("User already exists: {0}")]
    UserExists(String),

    /// Registration failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Create the admin user with roles `ROLE_ADMIN` and `ROLE_USER`.
///
/// # Returns
///
/// The ID of the created user.
pub async fn create_user(username: &str, password: Option<String>) -> Result<UserId, AdminError> {
    let username =
        Username::parse(username).map_err(|e| AdminError::InvalidUsername(e.to_string()))?;

    let database_url =
        super::database_url().ok_or(AdminError::MissingEnvVar("STOREFRONT_DATABASE_URL"))?;
    let password = password
        .or_else(|| std::env::var("STOREFRONT_ADMIN_PASSWORD").ok())
        .map(SecretString::from)
        .ok_or(AdminError::MissingEnvVar("STOREFRONT_ADMIN_PASSWORD"))?;

    tracing::info!("Connecting to storefront database...");
    let pool = db::create_pool(&database_url).await?;
    let users = UserDirectory::new(
        Arc::new(PgUserRepository::new(pool)),
        Arc::new(ReplicatedCacheTier::standalone()),
    );

    tracing::info!("Creating admin user: {}", username);
    match users
        .ensure_admin(&username, password.expose_secret())
        .await?
    {
        AdminBootstrap::Created(user) => {
            tracing::info!(
                "Admin user created successfully! ID: {}, Username: {}",
                user.id,
                user.username
            );
            Ok(user.id)
        }
        AdminBootstrap::AlreadyExists => Err(AdminError::UserExists(username.into_inner())),
    }
}
