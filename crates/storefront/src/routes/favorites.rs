//! Favorites route handlers.

use std::collections::BTreeSet;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use tracing::instrument;

use shelf_core::ProductId;

use crate::error::Result;
use crate::middleware::RequireUser;
use crate::models::Product;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct FavoritesCount {
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ToggleResult {
    pub product_id: ProductId,
    pub favorite: bool,
}

/// GET /favorites
#[instrument(skip(state, user), fields(username = %user))]
pub async fn index(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<Vec<Product>>> {
    Ok(Json(state.services().favorites.products_of(&user).await?))
}

/// GET /favorites/ids
pub async fn ids(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<BTreeSet<ProductId>>> {
    Ok(Json(state.services().favorites.ids_of(&user).await?))
}

/// GET /favorites/count
pub async fn count(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<FavoritesCount>> {
    let count = state.services().favorites.count(&user).await?;
    Ok(Json(FavoritesCount { count }))
}

/// POST /favorites/{id}
pub async fn add(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(product_id): Path<ProductId>,
) -> Result<StatusCode> {
    state.services().favorites.add(&user, product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /favorites/{id}
pub async fn remove(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(product_id): Path<ProductId>,
) -> Result<StatusCode> {
    state.services().favorites.remove(&user, product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /favorites/{id}/toggle
pub async fn toggle(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(product_id): Path<ProductId>,
) -> Result<Json<ToggleResult>> {
    let favorite = state.services().favorites.toggle(&user, product_id).await?;
    Ok(Json(ToggleResult {
        product_id,
        favorite,
    }))
}
