//! Integration tests for the cached product catalog.
//!
//! Reads are served from the cache tier after the first miss; every write
//! refreshes the `by-id` entry and drops the list-shaped caches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use shelf_core::{Price, ProductId};
use shelf_integration_tests::{CountingProducts, Harness, SlowProducts, draft};
use shelf_storefront::cache::{CacheName, CacheTier};
use shelf_storefront::db::{MemoryStore, ProductRepository};
use shelf_storefront::models::Product;
use shelf_storefront::services::StoreError;

// =============================================================================
// Read-through
// =============================================================================

#[tokio::test]
async fn test_save_then_find_returns_saved_value() {
    let h = Harness::standalone();
    let mut widget = h.product("Widget", 400, 5).await;

    widget.stock = 2;
    widget.price = Price::new(Decimal::new(350, 2)).unwrap();
    let saved = h.services.catalog.save(&widget).await.unwrap();

    assert_eq!(saved, widget);
    assert_eq!(
        h.services.catalog.find_by_id(widget.id).await.unwrap(),
        Some(widget)
    );
}

#[tokio::test]
async fn test_repeated_reads_hit_the_cache() {
    let counting = Arc::new(CountingProducts::new(Arc::new(MemoryStore::new())));
    let h = Harness::with_products(counting.clone());
    let widget = h.product("Widget", 400, 5).await;

    for _ in 0..3 {
        h.services.catalog.find_all().await.unwrap();
        h.services.catalog.search("wid", "").await.unwrap();
        h.services.catalog.find_by_id(widget.id).await.unwrap();
    }

    assert_eq!(CountingProducts::count(&counting.find_all), 1);
    assert_eq!(CountingProducts::count(&counting.search), 1);
    // create() already populated the by-id entry
    assert_eq!(CountingProducts::count(&counting.find_by_id), 0);
}

#[tokio::test]
async fn test_absence_is_not_cached() {
    let h = Harness::standalone();
    assert!(
        h.services
            .catalog
            .find_by_id(ProductId::new(1))
            .await
            .unwrap()
            .is_none()
    );

    let widget = ProductRepository::insert(&*h.store, &draft("Widget", 400, 5, None))
        .await
        .unwrap();
    assert_eq!(widget.id, ProductId::new(1));
    assert_eq!(
        h.services.catalog.find_by_id(widget.id).await.unwrap(),
        Some(widget)
    );
}

// =============================================================================
// Search and categories
// =============================================================================

#[tokio::test]
async fn test_empty_search_returns_everything() {
    let h = Harness::standalone();
    h.services
        .catalog
        .create(&draft("Widget", 400, 5, Some("Tools")))
        .await
        .unwrap();
    h.services
        .catalog
        .create(&draft("Gadget", 900, 1, None))
        .await
        .unwrap();
    h.services
        .catalog
        .create(&draft("Gizmo", 100, 7, Some("Toys")))
        .await
        .unwrap();

    let all = h.services.catalog.search("", "").await.unwrap();
    assert_eq!(all.len(), 3);

    let matches = h.services.catalog.search("WID", "").await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].name, "Widget");

    let toys = h.services.catalog.search("", "toy").await.unwrap();
    assert_eq!(toys.len(), 1);
    assert_eq!(toys[0].name, "Gizmo");
}

#[tokio::test]
async fn test_categories_skip_null_and_empty() {
    let h = Harness::standalone();
    for (name, category) in [
        ("Widget", Some("Tools")),
        ("Gadget", None),
        ("Gizmo", Some("")),
        ("Spanner", Some("Tools")),
        ("Kite", Some("Toys")),
    ] {
        h.services
            .catalog
            .create(&draft(name, 100, 1, category))
            .await
            .unwrap();
    }

    assert_eq!(
        h.services.catalog.find_distinct_categories().await.unwrap(),
        BTreeSet::from(["Tools".to_owned(), "Toys".to_owned()])
    );
}

// =============================================================================
// Invalidation
// =============================================================================

#[tokio::test]
async fn test_writes_invalidate_lists() {
    let h = Harness::standalone();
    let widget = h.product("Widget", 400, 5).await;
    assert_eq!(h.services.catalog.find_all().await.unwrap().len(), 1);
    assert_eq!(h.services.catalog.search("gad", "").await.unwrap().len(), 0);

    h.product("Gadget", 900, 1).await;
    assert_eq!(h.services.catalog.find_all().await.unwrap().len(), 2);
    assert_eq!(h.services.catalog.search("gad", "").await.unwrap().len(), 1);

    h.services.catalog.delete_by_id(widget.id).await.unwrap();
    assert_eq!(h.services.catalog.find_all().await.unwrap().len(), 1);
    assert!(
        h.services
            .catalog
            .find_by_id(widget.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_category_change_refreshes_categories() {
    let h = Harness::standalone();
    let mut widget = h
        .services
        .catalog
        .create(&draft("Widget", 400, 5, Some("Tools")))
        .await
        .unwrap();
    assert_eq!(
        h.services.catalog.find_distinct_categories().await.unwrap(),
        BTreeSet::from(["Tools".to_owned()])
    );

    widget.category = Some("Garden".to_owned());
    h.services.catalog.save(&widget).await.unwrap();

    assert_eq!(
        h.services.catalog.find_distinct_categories().await.unwrap(),
        BTreeSet::from(["Garden".to_owned()])
    );
}

#[tokio::test]
async fn test_missing_product_writes_leave_cache_alone() {
    let h = Harness::standalone();
    h.product("Widget", 400, 5).await;
    h.services.catalog.find_all().await.unwrap();

    let ghost = Product::from_draft(ProductId::new(99), draft("Ghost", 100, 1, None));
    assert!(matches!(
        h.services.catalog.save(&ghost).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        h.services.catalog.delete_by_id(ProductId::new(99)).await,
        Err(StoreError::NotFound(_))
    ));

    assert!(
        h.tier
            .get(CacheName::AllProducts, "all")
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        h.tier
            .get(CacheName::ProductById, "99")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_invalid_product_is_rejected_before_writing() {
    let h = Harness::standalone();
    let mut widget = h.product("Widget", 400, 5).await;
    widget.stock = -1;

    assert!(matches!(
        h.services.catalog.save(&widget).await,
        Err(StoreError::InvalidArgument(_))
    ));
    assert_eq!(
        h.services
            .catalog
            .find_fresh(widget.id)
            .await
            .unwrap()
            .unwrap()
            .stock,
        5
    );
}

#[tokio::test]
async fn test_undecodable_entry_is_treated_as_miss() {
    let h = Harness::standalone();
    let widget = h.product("Widget", 400, 5).await;
    h.tier
        .put(
            CacheName::ProductById,
            &widget.id.to_string(),
            b"not json".to_vec(),
        )
        .await
        .unwrap();

    assert_eq!(
        h.services.catalog.find_by_id(widget.id).await.unwrap(),
        Some(widget)
    );
}

#[tokio::test]
async fn test_slow_fill_does_not_overwrite_a_newer_write() {
    let inner = Arc::new(MemoryStore::new());
    let h = Harness::with_products(Arc::new(SlowProducts::new(
        inner,
        Duration::from_millis(200),
    )));
    let mut widget = h.product("Widget", 400, 5).await;

    let reader = {
        let catalog = h.services.catalog.clone();
        tokio::spawn(async move { catalog.find_all().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    widget.stock = 1;
    h.services.catalog.save(&widget).await.unwrap();

    // the reader took its snapshot before the save
    let stale = reader.await.unwrap().unwrap();
    assert_eq!(stale[0].stock, 5);

    let listed = h.services.catalog.find_all().await.unwrap();
    assert_eq!(listed[0].stock, 1);
    let cached = h.services.catalog.find_all().await.unwrap();
    assert_eq!(cached[0].stock, 1);
}
