//! Integration tests for checkout.

use std::sync::Arc;

use rust_decimal::Decimal;
use shelf_core::ProductId;
use shelf_integration_tests::{ContendedProducts, FlakyProducts, Harness, draft, user};
use shelf_storefront::db::{MemoryStore, ProductRepository};
use shelf_storefront::services::StoreError;

#[tokio::test]
async fn test_purchase_decrements_stock_and_clears_cart() {
    let h = Harness::replicated();
    let widget = h.product("Widget", 400, 5).await;
    let gadget = h.product("Gadget", 1250, 2).await;
    let bob = user("bob");
    h.services.cart.add_product(&bob, widget.id, 3).await.unwrap();
    h.services.cart.add_product(&bob, gadget.id, 2).await.unwrap();

    let receipt = h.services.purchase.purchase(&bob).await.unwrap();

    assert_eq!(receipt.lines.len(), 2);
    assert_eq!(receipt.total, Decimal::new(3700, 2));
    assert_eq!(
        h.services.catalog.find_by_id(widget.id).await.unwrap().unwrap().stock,
        2
    );
    assert_eq!(
        h.services.catalog.find_fresh(gadget.id).await.unwrap().unwrap().stock,
        0
    );
    assert!(h.services.cart.get_cart(&bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_repeated_adds_beyond_stock_fail_at_purchase() {
    let h = Harness::replicated();
    let widget = h.product("Widget", 400, 5).await;
    let bob = user("bob");

    // each add passes the stock check on its own
    h.services.cart.add_product(&bob, widget.id, 3).await.unwrap();
    h.services.cart.add_product(&bob, widget.id, 3).await.unwrap();

    match h.services.purchase.purchase(&bob).await {
        Err(StoreError::InsufficientStock { product }) => assert_eq!(product, "Widget"),
        other => panic!("expected insufficient stock, got {other:?}"),
    }
    assert_eq!(
        h.services.catalog.find_fresh(widget.id).await.unwrap().unwrap().stock,
        5
    );
    assert_eq!(
        h.services
            .cart
            .get_cart(&bob)
            .await
            .unwrap()
            .quantity_of(widget.id),
        Some(6)
    );
}

#[tokio::test]
async fn test_one_short_product_blocks_every_write() {
    let h = Harness::standalone();
    let widget = h.product("Widget", 400, 5).await;
    let mut gadget = h.product("Gadget", 1250, 4).await;
    let bob = user("bob");
    h.services.cart.add_product(&bob, widget.id, 1).await.unwrap();
    h.services.cart.add_product(&bob, gadget.id, 4).await.unwrap();

    gadget.stock = 1;
    h.services.catalog.save(&gadget).await.unwrap();

    assert!(matches!(
        h.services.purchase.purchase(&bob).await,
        Err(StoreError::InsufficientStock { .. })
    ));
    assert_eq!(
        h.services.catalog.find_fresh(widget.id).await.unwrap().unwrap().stock,
        5
    );
}

#[tokio::test]
async fn test_empty_cart_is_rejected() {
    let h = Harness::standalone();
    assert!(matches!(
        h.services.purchase.purchase(&user("bob")).await,
        Err(StoreError::EmptyCart)
    ));
}

#[tokio::test]
async fn test_deleted_product_aborts_purchase() {
    let h = Harness::standalone();
    let widget = h.product("Widget", 400, 5).await;
    let bob = user("bob");
    h.services.cart.add_product(&bob, widget.id, 1).await.unwrap();
    ProductRepository::delete(&*h.store, widget.id).await.unwrap();

    // hydration drops the vanished product, leaving nothing to buy
    assert!(matches!(
        h.services.purchase.purchase(&bob).await,
        Err(StoreError::EmptyCart)
    ));
}

#[tokio::test]
async fn test_partial_commit_is_not_rolled_back() {
    let inner = Arc::new(MemoryStore::new());
    let h = Harness::with_products(Arc::new(FlakyProducts::new(inner.clone(), 1)));
    let widget = h.product("Widget", 400, 5).await;
    let gadget = h.product("Gadget", 1250, 4).await;
    let bob = user("bob");
    h.services.cart.add_product(&bob, widget.id, 2).await.unwrap();
    h.services.cart.add_product(&bob, gadget.id, 1).await.unwrap();

    let err = h.services.purchase.purchase(&bob).await.unwrap_err();
    assert!(err.is_infrastructure());
    assert!(matches!(
        err,
        StoreError::PartiallyCommitted { committed: 1, ref source } if source.is_infrastructure()
    ));

    let stored = |id: ProductId| {
        let inner = inner.clone();
        async move {
            ProductRepository::find_by_id(&*inner, id)
                .await
                .unwrap()
                .unwrap()
                .stock
        }
    };
    // lines are processed in product id order
    assert_eq!(stored(widget.id).await, 3);
    assert_eq!(stored(gadget.id).await, 4);
    assert_eq!(h.services.cart.get_cart(&bob).await.unwrap().lines.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchases_by_one_user_do_not_interleave() {
    let h = Harness::replicated();
    let widget = h.product("Widget", 400, 10).await;
    let bob = user("bob");
    h.services.cart.add_product(&bob, widget.id, 4).await.unwrap();

    let first = {
        let purchase = h.services.purchase.clone();
        let bob = bob.clone();
        tokio::spawn(async move { purchase.purchase(&bob).await })
    };
    let second = {
        let purchase = h.services.purchase.clone();
        let bob = bob.clone();
        tokio::spawn(async move { purchase.purchase(&bob).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(StoreError::EmptyCart)))
    );
    assert_eq!(
        h.services.catalog.find_fresh(widget.id).await.unwrap().unwrap().stock,
        6
    );
}

#[tokio::test]
async fn test_sequential_purchases_share_stock() {
    let h = Harness::replicated();
    let widget = h.product("Widget", 400, 10).await;
    for name in ["ana", "bob"] {
        h.services
            .cart
            .add_product(&user(name), widget.id, 3)
            .await
            .unwrap();
    }

    h.services.purchase.purchase(&user("ana")).await.unwrap();
    h.services.purchase.purchase(&user("bob")).await.unwrap();

    assert_eq!(
        h.services.catalog.find_fresh(widget.id).await.unwrap().unwrap().stock,
        4
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchases_by_different_users_never_oversell() {
    let h = Harness::replicated();
    let widget = h.product("Widget", 400, 5).await;
    for name in ["ana", "bob"] {
        h.services
            .cart
            .add_product(&user(name), widget.id, 3)
            .await
            .unwrap();
    }

    let buy = |name: &'static str| {
        let purchase = h.services.purchase.clone();
        tokio::spawn(async move { purchase.purchase(&user(name)).await })
    };
    let (ana, bob) = tokio::join!(buy("ana"), buy("bob"));
    let results = [ana.unwrap(), bob.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(StoreError::InsufficientStock { product }) if product == "Widget"
    )));
    assert_eq!(
        h.services.catalog.find_fresh(widget.id).await.unwrap().unwrap().stock,
        2
    );
}

#[tokio::test]
async fn test_stock_lost_to_another_buyer_is_given_back() {
    let inner = Arc::new(MemoryStore::new());
    let widget = ProductRepository::insert(&*inner, &draft("Widget", 400, 5, None))
        .await
        .unwrap();
    let gadget = ProductRepository::insert(&*inner, &draft("Gadget", 1250, 4, None))
        .await
        .unwrap();
    let h = Harness::with_products(Arc::new(ContendedProducts::new(inner.clone(), gadget.id)));
    let bob = user("bob");
    h.services.cart.add_product(&bob, widget.id, 2).await.unwrap();
    h.services.cart.add_product(&bob, gadget.id, 1).await.unwrap();

    match h.services.purchase.purchase(&bob).await {
        Err(StoreError::InsufficientStock { product }) => assert_eq!(product, "Gadget"),
        other => panic!("expected insufficient stock, got {other:?}"),
    }
    assert_eq!(
        h.services.catalog.find_fresh(widget.id).await.unwrap().unwrap().stock,
        5
    );
    assert_eq!(
        h.services.catalog.find_by_id(widget.id).await.unwrap().unwrap().stock,
        5
    );
    assert_eq!(h.services.cart.get_cart(&bob).await.unwrap().lines.len(), 2);
}
