//! Per-user shopping carts held in the cache tier.
//!
//! A cart is a hash `cart:{username}` of product id to quantity. It exists
//! only in the tier until a purchase commits. Adding checks stock at that
//! moment but reserves nothing.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use shelf_core::{ProductId, Quantity, Username};

use super::{ProductCache, StoreError};
use crate::cache::keys::cart_key;
use crate::cache::{Consistency, VolatileStore};
use crate::models::Product;

/// One product in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartLine {
    pub product: Product,
    pub quantity: i64,
}

impl CartLine {
    /// Price times quantity.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidArgument` if the total overflows.
    pub fn line_total(&self) -> Result<Decimal, StoreError> {
        self.product
            .price
            .checked_total(self.quantity)
            .ok_or_else(|| total_overflow(&self.product.name))
    }
}

pub(crate) fn total_overflow(product: &str) -> StoreError {
    StoreError::InvalidArgument(format!("total for {product} is too large"))
}

/// Sum line totals without overflowing.
pub(crate) fn checked_sum(
    totals: impl IntoIterator<Item = Result<Decimal, StoreError>>,
) -> Result<Decimal, StoreError> {
    totals.into_iter().try_fold(Decimal::ZERO, |sum, total| {
        sum.checked_add(total?)
            .ok_or_else(|| StoreError::InvalidArgument("cart total is too large".to_owned()))
    })
}

/// A hydrated cart, ordered by product id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Cart {
    pub lines: Vec<CartLine>,
}

impl Cart {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Sum of every line total.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidArgument` if the total overflows.
    pub fn total(&self) -> Result<Decimal, StoreError> {
        checked_sum(self.lines.iter().map(CartLine::line_total))
    }

    /// Quantity for one product, if present.
    #[must_use]
    pub fn quantity_of(&self, id: ProductId) -> Option<i64> {
        self.lines
            .iter()
            .find(|line| line.product.id == id)
            .map(|line| line.quantity)
    }
}

/// Cart operations for authenticated users.
#[derive(Clone)]
pub struct CartStore {
    catalog: ProductCache,
    state: Arc<dyn VolatileStore>,
}

impl CartStore {
    #[must_use]
    pub fn new(catalog: ProductCache, state: Arc<dyn VolatileStore>) -> Self {
        Self { catalog, state }
    }

    /// Add `quantity` of a product, checking current stock first.
    ///
    /// Returns the product's new quantity in the cart. The check covers only
    /// this call's quantity, so repeated adds may exceed stock; purchase
    /// re-validates.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidArgument` for a non-positive quantity,
    /// `StoreError::NotFound` for an unknown product and
    /// `StoreError::InsufficientStock` when stock is below `quantity`.
    #[instrument(skip(self), fields(username = %username, product_id = %product_id))]
    pub async fn add_product(
        &self,
        username: &Username,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<i64, StoreError> {
        let quantity = Quantity::new(quantity)?;
        let product = self
            .catalog
            .find_fresh(product_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
        if i64::from(product.stock) < quantity.get() {
            return Err(StoreError::InsufficientStock {
                product: product.name,
            });
        }

        let in_cart = self
            .state
            .hash_increment(&cart_key(username), &product_id.to_string(), quantity.get())
            .await?;
        info!(quantity = quantity.get(), in_cart, "Added to cart");
        Ok(in_cart)
    }

    /// Remove a product entirely. Removing an absent product is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    #[instrument(skip(self), fields(username = %username, product_id = %product_id))]
    pub async fn remove_product(
        &self,
        username: &Username,
        product_id: ProductId,
    ) -> Result<(), StoreError> {
        let removed = self
            .state
            .hash_delete(&cart_key(username), &product_id.to_string())
            .await?;
        debug!(removed, "Removed from cart");
        Ok(())
    }

    /// The user's cart, hydrated with current product data.
    ///
    /// Products that no longer exist are dropped.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or tier fails.
    #[instrument(skip(self), fields(username = %username))]
    pub async fn get_cart(&self, username: &Username) -> Result<Cart, StoreError> {
        self.snapshot(username, Consistency::Relaxed).await
    }

    /// Number of distinct products in the cart.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the tier fails.
    pub async fn item_count(&self, username: &Username) -> Result<usize, StoreError> {
        Ok(self.state.hash_len(&cart_key(username)).await?)
    }

    pub(crate) async fn snapshot(
        &self,
        username: &Username,
        consistency: Consistency,
    ) -> Result<Cart, StoreError> {
        let entries = self
            .state
            .hash_get_all(&cart_key(username), consistency)
            .await?;
        if entries.is_empty() {
            return Ok(Cart::default());
        }

        let quantities = parse_entries(entries);
        let ids: Vec<ProductId> = quantities.keys().copied().collect();
        let products = self.catalog.find_all_by_id(&ids).await?;

        let mut lines: Vec<CartLine> = products
            .into_iter()
            .filter_map(|product| {
                quantities.get(&product.id).map(|&quantity| CartLine { product, quantity })
            })
            .collect();
        lines.sort_by_key(|line| line.product.id);
        Ok(Cart { lines })
    }

    /// Drop the whole cart.
    pub(crate) async fn clear(&self, username: &Username) -> Result<(), StoreError> {
        self.state.delete(&cart_key(username)).await?;
        Ok(())
    }
}

fn parse_entries(entries: HashMap<String, i64>) -> HashMap<ProductId, i64> {
    entries
        .into_iter()
        .filter_map(|(field, quantity)| match field.parse::<ProductId>() {
            Ok(id) if quantity > 0 => Some((id, quantity)),
            Ok(_) => None,
            Err(e) => {
                warn!(field = %field, error = %e, "Skipping malformed cart entry");
                None
            }
        })
        .collect()
}
