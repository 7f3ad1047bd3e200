//! User domain types.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use shelf_core::{Role, UserId, Username};

/// A registered storefront user.
///
/// Implements `Debug` manually to redact the password hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: UserId,
    /// Login name, also the key for per-user cart and favorites state.
    pub username: Username,
    /// Argon2 PHC string.
    pub password_hash: String,
    /// Granted roles.
    pub roles: BTreeSet<Role>,
}

impl User {
    /// Whether the user holds `role`.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"[REDACTED]")
            .field("roles", &self.roles)
            .finish()
    }
}

/// Fields for inserting a user.
#[derive(Clone)]
pub struct NewUser {
    pub username: Username,
    pub password_hash: String,
    pub roles: BTreeSet<Role>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_hash() {
        let user = User {
            id: UserId::new(1),
            username: Username::parse("ana").unwrap(),
            password_hash: "$argon2id$v=19$secret".to_owned(),
            roles: BTreeSet::from([Role::User]),
        };
        let debug = format!("{user:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("argon2id"));
        assert!(user.has_role(Role::User));
        assert!(!user.has_role(Role::Admin));
    }
}
