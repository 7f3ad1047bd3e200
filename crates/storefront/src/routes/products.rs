//! Product catalog route handlers.
//!
//! Reads go through the product cache. Writes go to the system of record,
//! refresh the caches and then broadcast the new catalog.

use std::collections::BTreeSet;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use tracing::instrument;

use shelf_core::ProductId;

use super::notify_catalog_changed;
use crate::error::{AppError, Result};
use crate::models::{Product, ProductDraft};
use crate::state::AppState;

/// Search query parameters. Missing fields match everything.
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
}

/// List all products.
///
/// GET /api/v1/products
#[instrument(skip(state))]
pub async fn index(State(state): State<AppState>) -> Result<Json<Vec<Product>>> {
    Ok(Json(state.services().catalog.find_all().await?))
}

/// Search products by name and category.
///
/// GET /api/v1/products/search?name=&category=
#[instrument(skip(state))]
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Product>>> {
    let products = state
        .services()
        .catalog
        .search(&query.name, &query.category)
        .await?;
    Ok(Json(products))
}

/// Show a single product.
///
/// GET /api/v1/products/{id}
#[instrument(skip(state))]
pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
) -> Result<Json<Product>> {
    state
        .services()
        .catalog
        .find_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("product {id}")))
}

/// List distinct categories.
///
/// GET /api/v1/categories
#[instrument(skip(state))]
pub async fn categories(State(state): State<AppState>) -> Result<Json<BTreeSet<String>>> {
    Ok(Json(
        state.services().catalog.find_distinct_categories().await?,
    ))
}

/// Create a product.
///
/// POST /api/v1/products
#[instrument(skip(state, draft), fields(name = %draft.name))]
pub async fn create(
    State(state): State<AppState>,
    Json(draft): Json<ProductDraft>,
) -> Result<(StatusCode, Json<Product>)> {
    let product = state.services().catalog.create(&draft).await?;
    notify_catalog_changed(&state).await;
    Ok((StatusCode::CREATED, Json(product)))
}

/// Overwrite a product.
///
/// PUT /api/v1/products/{id}
#[instrument(skip(state, draft))]
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
    Json(draft): Json<ProductDraft>,
) -> Result<Json<Product>> {
    let product = state
        .services()
        .catalog
        .save(&Product::from_draft(id, draft))
        .await?;
    notify_catalog_changed(&state).await;
    Ok(Json(product))
}

/// Delete a product.
///
/// DELETE /api/v1/products/{id}
#[instrument(skip(state))]
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
) -> Result<StatusCode> {
    state.services().catalog.delete_by_id(id).await?;
    notify_catalog_changed(&state).await;
    Ok(StatusCode::NO_CONTENT)
}
