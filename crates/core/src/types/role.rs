//! Role labels attached to users.
//!
//! Roles are stored and exchanged as their label strings (`ROLE_ADMIN`,
//! `ROLE_USER`); route authorization itself lives outside this workspace.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Error returned for an unknown role label.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown role label: {0}")]
pub struct RoleError(pub String);

/// A user role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "ROLE_ADMIN")]
    Admin,
    #[serde(rename = "ROLE_USER")]
    User,
}

impl Role {
    /// The stored label for this role.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Admin => "ROLE_ADMIN",
            Self::User => "ROLE_USER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Role {
    type Err = RoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ROLE_ADMIN" => Ok(Self::Admin),
            "ROLE_USER" => Ok(Self::User),
            other => Err(RoleError(other.to_owned())),
        }
    }
}
