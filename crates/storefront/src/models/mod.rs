//! Domain models for the storefront.
//!
//! These are validated domain objects, separate from database row types.

pub mod product;
pub mod user;

pub use product::{Product, ProductDraft, ProductValidationError};
pub use user::{NewUser, User};
