//! Shelf storefront library.
//!
//! Cache-coherent product catalog over a system of record, per-user carts
//! and favorites held in a replicated cache tier, checkout under a lease
//! lock, and catalog change broadcasts. The binary wires these behind a
//! thin JSON/SSE HTTP surface.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
