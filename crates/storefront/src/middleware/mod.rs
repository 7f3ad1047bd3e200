//! HTTP middleware and extractors for the storefront.
//!
//! Authentication happens upstream; the proxy forwards the authenticated
//! username in [`identity::AUTHENTICATED_USER_HEADER`].

pub mod identity;

pub use identity::{AUTHENTICATED_USER_HEADER, RequireUser};
