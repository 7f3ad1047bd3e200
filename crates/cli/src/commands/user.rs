//! Customer account commands.
//!
//! # Usage
//!
//! ```bash
//! shelf-cli user create -u ana -p 'at-least-eight'
//! shelf-cli user verify -u ana -p 'at-least-eight'
//! ```
//!
//! # Environment Variables
//!
//! - `STOREFRONT_DATABASE_URL` (or `DATABASE_URL`) - `PostgreSQL` connection string

use std::sync::Arc;

use thiserror::Error;

use shelf_core::{UserId, Username};
use shelf_storefront::cache::ReplicatedCacheTier;
use shelf_storefront::db::{self, PgUserRepository};
use shelf_storefront::services::{StoreError, UserDirectory};

/// Errors that can occur during user operations.
#[derive(Debug, Error)]
pub enum UserError {
    /// Required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// Database connection error.
    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid username.
    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    /// No user with this name.
    #[error("No such user: {0}")]
    UnknownUser(String),

    /// The password does not match the stored hash.
    #[error("Password does not match for {0}")]
    WrongPassword(String),

    /// Lookup or registration failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

async fn directory() -> Result<UserDirectory, UserError> {
    let database_url =
        super::database_url().ok_or(UserError::MissingEnvVar("STOREFRONT_DATABASE_URL"))?;
    tracing::info!("Connecting to storefront database...");
    let pool = db::create_pool(&database_url).await?;
    Ok(UserDirectory::new(
        Arc::new(PgUserRepository::new(pool)),
        Arc::new(ReplicatedCacheTier::standalone()),
    ))
}

fn parse_username(username: &str) -> Result<Username, UserError> {
    Username::parse(username).map_err(|e| UserError::InvalidUsername(e.to_string()))
}

/// Register a customer with role `ROLE_USER`.
pub async fn create(username: &str, password: &str) -> Result<UserId, UserError> {
    let username = parse_username(username)?;
    let user = directory().await?.register(&username, password).await?;
    tracing::info!("User created! ID: {}, Username: {}", user.id, user.username);
    Ok(user.id)
}

/// Check a password against the stored hash.
pub async fn verify(username: &str, password: &str) -> Result<(), UserError> {
    let username = parse_username(username)?;
    let user = directory()
        .await?
        .find_by_username(&username)
        .await?
        .ok_or_else(|| UserError::UnknownUser(username.to_string()))?;

    if !UserDirectory::verify_password(&user, password) {
        return Err(UserError::WrongPassword(username.into_inner()));
    }
    tracing::info!("Password verified for {}", user.username);
    Ok(())
}
