//! `PostgreSQL` user repository.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::PgPool;

use shelf_core::{Role, UserId, Username};

use super::{RepositoryError, UserRepository};
use crate::models::{NewUser, User};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: UserId,
    username: String,
    password_hash: String,
    roles: Vec<String>,
}

impl TryFrom<UserRow> for User {
    type Error = RepositoryError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let username = Username::parse(&row.username).map_err(|e| {
            RepositoryError::DataCorruption(format!("invalid username in database: {e}"))
        })?;
        let roles = row
            .roles
            .iter()
            .map(|label| label.parse::<Role>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| RepositoryError::DataCorruption(format!("invalid role in database: {e}")))?;

        Ok(Self {
            id: row.id,
            username,
            password_hash: row.password_hash,
            roles,
        })
    }
}

/// Repository for user database operations.
#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    /// Create a new user repository.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_username(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query_as::<_, UserRow>(
            r"
            SELECT u.id, u.username, u.password_hash,
                   COALESCE(array_agg(r.role ORDER BY r.role)
                            FILTER (WHERE r.role IS NOT NULL), '{}') AS roles
            FROM shelf.app_user u
            LEFT JOIN shelf.user_role r ON r.user_id = u.id
            WHERE u.username = $1
            GROUP BY u.id
            ",
        )
        .bind(username.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn insert(&self, user: &NewUser) -> Result<User, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let id: UserId = sqlx::query_scalar(
            r"
            INSERT INTO shelf.app_user (username, password_hash)
            VALUES ($1, $2)
            RETURNING id
            ",
        )
        .bind(user.username.as_str())
        .bind(&user.password_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return RepositoryError::Conflict("username already exists".to_owned());
            }
            RepositoryError::Database(e)
        })?;

        for role in &user.roles {
            sqlx::query("INSERT INTO shelf.user_role (user_id, role) VALUES ($1, $2)")
                .bind(id)
                .bind(role.label())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(User {
            id,
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            roles: user.roles.clone(),
        })
    }
}
