//! Product domain types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shelf_core::{Price, ProductId};

/// Maximum stored length of a product image reference.
pub const MAX_IMAGE_URL_LENGTH: usize = 512;

/// Reasons a product or draft is rejected before it reaches the database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProductValidationError {
    #[error("product name cannot be empty")]
    EmptyName,
    #[error("stock cannot be negative (got {0})")]
    NegativeStock(i32),
    #[error("image reference must be at most {max} characters (got {len})")]
    ImageUrlTooLong { max: usize, len: usize },
}

/// A sellable item as stored in the system of record.
///
/// Cached snapshots serialize this type as JSON, so every field round-trips
/// through the cache tier unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Price,
    pub stock: i32,
    pub category: Option<String>,
    pub image_url: Option<String>,
}

impl Product {
    /// Combine an identifier with draft fields, e.g. for an update request.
    #[must_use]
    pub fn from_draft(id: ProductId, draft: ProductDraft) -> Self {
        Self {
            id,
            name: draft.name,
            price: draft.price,
            stock: draft.stock,
            category: draft.category,
            image_url: draft.image_url,
        }
    }

    /// Check the field invariants enforced before every write.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ProductValidationError> {
        validate_fields(&self.name, self.stock, self.image_url.as_deref())
    }
}

/// Product fields without an identifier, used for creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDraft {
    pub name: String,
    pub price: Price,
    pub stock: i32,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl ProductDraft {
    /// Check the field invariants enforced before every write.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ProductValidationError> {
        validate_fields(&self.name, self.stock, self.image_url.as_deref())
    }
}

fn validate_fields(
    name: &str,
    stock: i32,
    image_url: Option<&str>,
) -> Result<(), ProductValidationError> {
    if name.trim().is_empty() {
        return Err(ProductValidationError::EmptyName);
    }
    if stock < 0 {
        return Err(ProductValidationError::NegativeStock(stock));
    }
    if let Some(url) = image_url {
        let len = url.chars().count();
        if len > MAX_IMAGE_URL_LENGTH {
            return Err(ProductValidationError::ImageUrlTooLong {
                max: MAX_IMAGE_URL_LENGTH,
                len,
            });
        }
    }
    Ok(())
}
