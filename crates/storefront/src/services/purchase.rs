//! Checkout: turn a cart into stock decrements.
//!
//! The flow runs under the per-user lease `lock:purchase:{username}`, so two
//! purchases by the same user never interleave:
//!
//! 1. Read the cart from the primary.
//! 2. Re-read every product from the system of record and check stock. Any
//!    business failure here aborts before anything is written.
//! 3. Decrement each product's stock with one conditional write that never
//!    takes stock below zero, so purchases by different users cannot
//!    oversell. Each write refreshes the catalog caches.
//! 4. Delete the cart once every write succeeded.
//!
//! If another purchase takes the stock between steps 2 and 3, the lines
//! already decremented are given back and the business error is returned.
//! If an infrastructure failure interrupts step 3 or 4 after the first
//! write, committed lines stay decremented, the cart is kept and the error
//! is [`StoreError::PartiallyCommitted`].

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use shelf_core::{Price, ProductId, Username};

use super::cart::{checked_sum, total_overflow};
use super::{CartStore, LeaseLocks, ProductCache, StoreError};
use crate::cache::Consistency;
use crate::cache::keys::purchase_lock_key;
use crate::models::Product;

/// One purchased product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchasedLine {
    pub product_id: ProductId,
    pub name: String,
    pub unit_price: Price,
    pub quantity: i64,
    pub remaining_stock: i32,
}

/// What a completed purchase bought.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseReceipt {
    pub lines: Vec<PurchasedLine>,
    pub total: Decimal,
}

/// Coordinates checkout across the cart, the catalog and the lease lock.
#[derive(Clone)]
pub struct PurchaseCoordinator {
    cart: CartStore,
    catalog: ProductCache,
    locks: LeaseLocks,
}

impl PurchaseCoordinator {
    #[must_use]
    pub const fn new(cart: CartStore, catalog: ProductCache, locks: LeaseLocks) -> Self {
        Self {
            cart,
            catalog,
            locks,
        }
    }

    /// Purchase everything in the user's cart.
    ///
    /// The caller is responsible for broadcasting the catalog change, also
    /// after a [`StoreError::PartiallyCommitted`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::EmptyCart`, `StoreError::NotFound` or
    /// `StoreError::InsufficientStock` with stock left as it was,
    /// `StoreError::PartiallyCommitted` if an infrastructure failure
    /// interrupted the writes, or another infrastructure error (including a
    /// lock timeout) before anything was written.
    #[instrument(skip(self), fields(username = %username))]
    pub async fn purchase(&self, username: &Username) -> Result<PurchaseReceipt, StoreError> {
        self.locks
            .scoped(purchase_lock_key(username), || self.purchase_locked(username))
            .await
    }

    async fn purchase_locked(&self, username: &Username) -> Result<PurchaseReceipt, StoreError> {
        let cart = self.cart.snapshot(username, Consistency::Strong).await?;
        if cart.is_empty() {
            return Err(StoreError::EmptyCart);
        }

        let mut staged: Vec<(Product, i32)> = Vec::with_capacity(cart.lines.len());
        for line in &cart.lines {
            let current = self
                .catalog
                .find_fresh(line.product.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("product {}", line.product.id)))?;
            let quantity = i32::try_from(line.quantity).map_err(|_| {
                StoreError::InvalidArgument(format!("quantity {} out of range", line.quantity))
            })?;
            if current.stock < quantity {
                return Err(StoreError::InsufficientStock {
                    product: current.name,
                });
            }
            staged.push((current, quantity));
        }

        let total = checked_sum(staged.iter().map(|(product, quantity)| {
            product
                .price
                .checked_total(i64::from(*quantity))
                .ok_or_else(|| total_overflow(&product.name))
        }))?;

        let mut lines: Vec<PurchasedLine> = Vec::with_capacity(staged.len());
        for (product, quantity) in &staged {
            match self.catalog.adjust_stock(product.id, -*quantity).await {
                Ok(saved) => lines.push(PurchasedLine {
                    product_id: saved.id,
                    name: saved.name,
                    unit_price: saved.price,
                    quantity: i64::from(*quantity),
                    remaining_stock: saved.stock,
                }),
                Err(e) => return Err(self.abandon(&lines, product, e).await),
            }
        }

        if let Err(e) = self.cart.clear(username).await {
            error!(error = %e, "Stock committed but the cart could not be cleared");
            return Err(StoreError::PartiallyCommitted {
                committed: lines.len(),
                source: Box::new(e),
            });
        }

        info!(items = lines.len(), %total, "Purchase completed");
        Ok(PurchaseReceipt { lines, total })
    }

    /// Turn a failed stock write into the purchase's error.
    ///
    /// A business failure means another purchase won the stock; committed
    /// lines are given back. An infrastructure failure leaves them in place.
    async fn abandon(
        &self,
        committed: &[PurchasedLine],
        failed: &Product,
        err: StoreError,
    ) -> StoreError {
        let err = match err {
            StoreError::InsufficientStock { .. } => StoreError::InsufficientStock {
                product: failed.name.clone(),
            },
            other => other,
        };
        if committed.is_empty() {
            return err;
        }
        if err.is_infrastructure() {
            error!(
                committed = committed.len(),
                error = %err,
                "Purchase interrupted after committing stock"
            );
            return StoreError::PartiallyCommitted {
                committed: committed.len(),
                source: Box::new(err),
            };
        }

        warn!(
            product = failed.name.as_str(),
            committed = committed.len(),
            "Stock taken by a concurrent purchase, giving back committed lines"
        );
        for (undone, line) in committed.iter().rev().enumerate() {
            let restock = i32::try_from(line.quantity).unwrap_or(i32::MAX);
            if let Err(e) = self.catalog.adjust_stock(line.product_id, restock).await {
                error!(product_id = %line.product_id, error = %e, "Could not give back stock");
                return StoreError::PartiallyCommitted {
                    committed: committed.len() - undone,
                    source: Box::new(e),
                };
            }
        }
        err
    }
}
