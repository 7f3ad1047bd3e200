//! User lookup, registration and admin bootstrap.

use std::collections::BTreeSet;
use std::sync::Arc;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use tracing::{debug, info, instrument, warn};

use shelf_core::{Role, Username};

use super::StoreError;
use crate::cache::CacheTier;
use crate::cache::json::{fill_json, get_json};
use crate::cache::keys::CacheName;
use crate::db::{RepositoryError, UserRepository};
use crate::models::{NewUser, User};

/// Minimum password length.
const MIN_PASSWORD_LENGTH: usize = 8;

/// Outcome of [`UserDirectory::ensure_admin`].
#[derive(Debug)]
pub enum AdminBootstrap {
    Created(User),
    AlreadyExists,
}

/// Read-through cached access to users.
#[derive(Clone)]
pub struct UserDirectory {
    users: Arc<dyn UserRepository>,
    cache: Arc<dyn CacheTier>,
}

impl UserDirectory {
    #[must_use]
    pub fn new(users: Arc<dyn UserRepository>, cache: Arc<dyn CacheTier>) -> Self {
        Self { users, cache }
    }

    /// Look a user up by username. Absence is not cached.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or cache fails.
    #[instrument(skip(self), fields(username = %username))]
    pub async fn find_by_username(&self, username: &Username) -> Result<Option<User>, StoreError> {
        if let Some(user) = get_json(&*self.cache, CacheName::Users, username.as_str()).await? {
            debug!("Cache hit for user");
            return Ok(Some(user));
        }
        debug!("Cache miss for user");
        let generation = self.cache.generation(CacheName::Users).await?;
        let user = self.users.find_by_username(username).await?;
        if let Some(user) = &user {
            fill_json(&*self.cache, CacheName::Users, username.as_str(), user, generation).await?;
        }
        Ok(user)
    }

    /// Register a user with role `ROLE_USER`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the username is taken and
    /// `StoreError::InvalidArgument` if the password is too short.
    #[instrument(skip(self, password), fields(username = %username))]
    pub async fn register(&self, username: &Username, password: &str) -> Result<User, StoreError> {
        self.insert(username, password, BTreeSet::from([Role::User]))
            .await
    }

    /// Create an administrator with roles `ROLE_ADMIN` and `ROLE_USER` unless
    /// the username already exists. An existing account is never changed; a
    /// password that no longer matches it is only reported.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidArgument` if the password is too short, or
    /// an infrastructure error.
    #[instrument(skip(self, password), fields(username = %username))]
    pub async fn ensure_admin(
        &self,
        username: &Username,
        password: &str,
    ) -> Result<AdminBootstrap, StoreError> {
        if let Some(existing) = self.find_by_username(username).await? {
            if Self::verify_password(&existing, password) {
                info!("Admin user already present");
            } else {
                warn!("Admin user exists with a different password; leaving it unchanged");
            }
            return Ok(AdminBootstrap::AlreadyExists);
        }
        match self
            .insert(username, password, BTreeSet::from([Role::Admin, Role::User]))
            .await
        {
            Ok(user) => {
                info!("Admin user created");
                Ok(AdminBootstrap::Created(user))
            }
            Err(StoreError::Conflict(_)) => Ok(AdminBootstrap::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    /// Check a password against the user's stored hash.
    #[must_use]
    pub fn verify_password(user: &User, password: &str) -> bool {
        verify_password(password, &user.password_hash)
    }

    async fn insert(
        &self,
        username: &Username,
        password: &str,
        roles: BTreeSet<Role>,
    ) -> Result<User, StoreError> {
        validate_password(password)?;
        let new_user = NewUser {
            username: username.clone(),
            password_hash: hash_password(password)?,
            roles,
        };
        let user = self.users.insert(&new_user).await.map_err(|e| match e {
            RepositoryError::Conflict(_) => {
                StoreError::Conflict(format!("username {username} already exists"))
            }
            other => StoreError::Repository(other),
        })?;
        self.cache
            .evict(CacheName::Users, username.as_str())
            .await?;
        info!(user_id = %user.id, "User registered");
        Ok(user)
    }
}

fn validate_password(password: &str) -> Result<(), StoreError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(StoreError::InvalidArgument(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Hash a password using Argon2id.
///
/// # Errors
///
/// Returns `StoreError::PasswordHash` if hashing fails.
pub fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| StoreError::PasswordHash)
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}
