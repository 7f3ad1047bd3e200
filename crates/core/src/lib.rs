//! Shelf Core - Shared types library.
//!
//! This crate provides common types used across all Shelf components:
//! - `storefront` - Catalog, cart, favorites and the admin product API
//! - `cli` - Command-line tools for migrations, seeding and admin bootstrap
//!
//! # Architecture
//!
//! The core crate contains only types and validation - no I/O, no database
//! access, no cache clients. This keeps it lightweight and allows it to be
//! used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for type-safe IDs, prices, quantities,
//!   usernames and role labels

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
