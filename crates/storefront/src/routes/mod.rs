//! HTTP route handlers for storefront.
//!
//! # Route Structure
//!
//! ```text
//! GET    /health                     - Liveness check
//! GET    /health/ready               - Readiness check (store + cache primary)
//!
//! # Catalog
//! GET    /api/v1/products            - All products
//! GET    /api/v1/products/search     - Search (?name=&category=)
//! GET    /api/v1/products/{id}       - One product
//! GET    /api/v1/categories          - Distinct categories
//! POST   /api/v1/products            - Create (broadcasts)
//! PUT    /api/v1/products/{id}       - Overwrite (broadcasts)
//! DELETE /api/v1/products/{id}       - Delete (broadcasts)
//!
//! # Cart (requires x-authenticated-user)
//! GET    /cart                       - Hydrated cart with total
//! GET    /cart/count                 - Distinct products
//! POST   /cart/items/{id}            - Add {quantity}
//! DELETE /cart/items/{id}            - Remove
//! POST   /cart/purchase              - Buy everything (broadcasts)
//!
//! # Favorites (requires x-authenticated-user)
//! GET    /favorites                  - Favorite products
//! GET    /favorites/ids              - Favorite ids
//! GET    /favorites/count            - Count
//! POST   /favorites/{id}             - Add
//! DELETE /favorites/{id}             - Remove
//! POST   /favorites/{id}/toggle      - Toggle
//!
//! # Updates
//! GET    /topic/products             - SSE stream of catalog snapshots
//! ```

pub mod cart;
pub mod favorites;
pub mod products;
pub mod topic;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;

/// Create the catalog API router.
pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/products", get(products::index).post(products::create))
        .route("/products/search", get(products::search))
        .route(
            "/products/{id}",
            get(products::show)
                .put(products::update)
                .delete(products::delete),
        )
        .route("/categories", get(products::categories))
}

/// Create the cart routes router.
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(cart::show))
        .route("/count", get(cart::count))
        .route("/items/{id}", post(cart::add).delete(cart::remove))
        .route("/purchase", post(cart::purchase))
}

/// Create the favorites routes router.
pub fn favorites_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(favorites::index))
        .route("/ids", get(favorites::ids))
        .route("/count", get(favorites::count))
        .route("/{id}", post(favorites::add).delete(favorites::remove))
        .route("/{id}/toggle", post(favorites::toggle))
}

/// Create all routes for the storefront.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .nest("/api/v1", product_routes())
        .nest("/cart", cart_routes())
        .nest("/favorites", favorites_routes())
        .route("/topic/products", get(topic::products))
}

/// Build the application with state and request tracing.
pub fn app(state: AppState) -> Router {
    routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness health check endpoint.
///
/// Returns "ok" if the server is running. Does not check dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness health check endpoint.
///
/// Verifies database connectivity (when backed by `PostgreSQL`) and that the
/// cache primary is online. Returns 503 Service Unavailable otherwise.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    if let Err(e) = state.cache().ping().await {
        warn!(error = %e, "Cache primary is not ready");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    let Some(pool) = state.pool() else {
        return StatusCode::OK;
    };
    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Broadcast the catalog after a committed write, including one that was
/// interrupted after its first write.
///
/// The write already succeeded, so a failed broadcast is only logged.
async fn notify_catalog_changed(state: &AppState) {
    if let Err(e) = state.services().broadcaster.notify_update().await {
        warn!(error = %e, "Catalog update broadcast failed");
    }
}
