//! Cart and checkout route handlers.
//!
//! Every route acts on the cart of the user named by the upstream proxy.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use shelf_core::ProductId;

use super::notify_catalog_changed;
use crate::error::Result;
use crate::middleware::RequireUser;
use crate::services::{Cart, CartLine, PurchaseReceipt, StoreError};
use crate::state::AppState;

/// Cart as returned to clients.
#[derive(Debug, Serialize)]
pub struct CartView {
    pub lines: Vec<CartLine>,
    pub total: Decimal,
}

impl TryFrom<Cart> for CartView {
    type Error = StoreError;

    fn try_from(cart: Cart) -> std::result::Result<Self, Self::Error> {
        let total = cart.total()?;
        Ok(Self {
            lines: cart.lines,
            total,
        })
    }
}

/// Add-to-cart body.
#[derive(Debug, Deserialize)]
pub struct AddToCartForm {
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

const fn default_quantity() -> i64 {
    1
}

/// Quantity of one product after an add.
#[derive(Debug, Serialize)]
pub struct CartQuantity {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// Distinct products in the cart.
#[derive(Debug, Serialize)]
pub struct CartCount {
    pub count: usize,
}

/// Show the cart.
///
/// GET /cart
#[instrument(skip(state, user), fields(username = %user))]
pub async fn show(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<CartView>> {
    let cart = state.services().cart.get_cart(&user).await?;
    Ok(Json(CartView::try_from(cart)?))
}

/// Count distinct products in the cart.
///
/// GET /cart/count
pub async fn count(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<CartCount>> {
    let count = state.services().cart.item_count(&user).await?;
    Ok(Json(CartCount { count }))
}

/// Add a product to the cart.
///
/// POST /cart/items/{id}
#[instrument(skip(state, user, form), fields(username = %user))]
pub async fn add(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(product_id): Path<ProductId>,
    Json(form): Json<AddToCartForm>,
) -> Result<Json<CartQuantity>> {
    let quantity = state
        .services()
        .cart
        .add_product(&user, product_id, form.quantity)
        .await?;
    Ok(Json(CartQuantity {
        product_id,
        quantity,
    }))
}

/// Remove a product from the cart.
///
/// DELETE /cart/items/{id}
#[instrument(skip(state, user), fields(username = %user))]
pub async fn remove(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(product_id): Path<ProductId>,
) -> Result<StatusCode> {
    state
        .services()
        .cart
        .remove_product(&user, product_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Buy everything in the cart.
///
/// POST /cart/purchase
#[instrument(skip(state, user), fields(username = %user))]
pub async fn purchase(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<PurchaseReceipt>> {
    match state.services().purchase.purchase(&user).await {
        Ok(receipt) => {
            notify_catalog_changed(&state).await;
            Ok(Json(receipt))
        }
        Err(e @ StoreError::PartiallyCommitted { .. }) => {
            notify_catalog_changed(&state).await;
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
