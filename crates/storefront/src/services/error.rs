//! Service error types.

use thiserror::Error;

use shelf_core::{QuantityError, UsernameError};

use crate::cache::CacheError;
use crate::db::RepositoryError;
use crate::models::ProductValidationError;

/// Errors returned by the storefront services.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced product or user does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Requested quantity exceeds current stock.
    #[error("insufficient stock for {product}")]
    InsufficientStock {
        /// Name of the product that ran short.
        product: String,
    },

    /// Purchase attempted with nothing in the cart.
    #[error("the cart is empty")]
    EmptyCart,

    /// Caller input failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A unique value is already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// System of record failure.
    #[error("database error: {0}")]
    Repository(#[from] RepositoryError),

    /// Cache tier failure.
    #[error("cache tier error: {0}")]
    Cache(#[from] CacheError),

    /// Payload encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Password hashing failure.
    #[error("password hashing error")]
    PasswordHash,

    /// An infrastructure failure interrupted a multi-step write after some
    /// of it was committed.
    #[error("interrupted after {committed} committed writes: {source}")]
    PartiallyCommitted {
        committed: usize,
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Whether this is an infrastructure failure rather than a business outcome.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Repository(_)
                | Self::Cache(_)
                | Self::Serialization(_)
                | Self::PasswordHash
                | Self::PartiallyCommitted { .. }
        )
    }
}

impl From<ProductValidationError> for StoreError {
    fn from(err: ProductValidationError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<QuantityError> for StoreError {
    fn from(err: QuantityError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<UsernameError> for StoreError {
    fn from(err: UsernameError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
