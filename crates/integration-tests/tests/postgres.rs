//! `PostgreSQL` repository tests.
//!
//! Run with a migrated database:
//!
//! ```bash
//! STOREFRONT_DATABASE_URL=postgres://... cargo test -p shelf-integration-tests -- --ignored
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use secrecy::SecretString;
use sqlx::PgPool;
use uuid::Uuid;

use shelf_core::{ProductId, Role};
use shelf_integration_tests::{draft, test_locks, user};
use shelf_storefront::cache::ReplicatedCacheTier;
use shelf_storefront::db::{
    self, PgProductRepository, PgUserRepository, ProductRepository, RepositoryError,
    UserRepository,
};
use shelf_storefront::models::NewUser;
use shelf_storefront::services::Services;

async fn pool() -> PgPool {
    let url = std::env::var("STOREFRONT_DATABASE_URL")
        .expect("STOREFRONT_DATABASE_URL must be set for PostgreSQL tests");
    let pool = db::create_pool(&SecretString::from(url)).await.unwrap();
    sqlx::migrate!("../storefront/migrations")
        .run(&pool)
        .await
        .unwrap();
    pool
}

/// A name no other test run will use.
fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_product_round_trip() {
    let repo = PgProductRepository::new(pool().await);
    let name = unique("Widget");

    let created = repo.insert(&draft(&name, 1999, 4, Some("Tools"))).await.unwrap();
    assert_eq!(repo.find_by_id(created.id).await.unwrap(), Some(created.clone()));

    let mut changed = created.clone();
    changed.stock = 1;
    changed.category = None;
    assert_eq!(repo.update(&changed).await.unwrap(), changed);

    repo.delete(created.id).await.unwrap();
    assert!(repo.find_by_id(created.id).await.unwrap().is_none());
    assert!(matches!(
        repo.delete(created.id).await,
        Err(RepositoryError::NotFound)
    ));
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_search_is_case_insensitive_and_literal() {
    let repo = PgProductRepository::new(pool().await);
    let token = Uuid::new_v4().simple().to_string();
    let plain = repo
        .insert(&draft(&format!("Lamp {token}"), 500, 1, Some("Home")))
        .await
        .unwrap();
    let percent = repo
        .insert(&draft(&format!("50% Lamp {token}"), 500, 1, None))
        .await
        .unwrap();

    let found = repo.search(&token.to_uppercase(), "").await.unwrap();
    let ids: BTreeSet<ProductId> = found.iter().map(|p| p.id).collect();
    assert_eq!(ids, BTreeSet::from([plain.id, percent.id]));

    let literal = repo.search(&format!("50% lamp {token}"), "").await.unwrap();
    assert_eq!(literal.len(), 1);
    assert_eq!(literal[0].id, percent.id);

    let by_category = repo.search(&token, "hom").await.unwrap();
    assert_eq!(by_category.len(), 1);
    assert_eq!(by_category[0].id, plain.id);
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_batched_lookup_skips_unknown_ids() {
    let repo = PgProductRepository::new(pool().await);
    let a = repo.insert(&draft(&unique("A"), 100, 1, None)).await.unwrap();
    let b = repo.insert(&draft(&unique("B"), 100, 1, None)).await.unwrap();

    let found = repo
        .find_all_by_id(&[b.id, ProductId::new(i64::MAX), a.id])
        .await
        .unwrap();
    let ids: BTreeSet<ProductId> = found.iter().map(|p| p.id).collect();
    assert_eq!(ids, BTreeSet::from([a.id, b.id]));
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_negative_stock_violates_constraint() {
    let repo = PgProductRepository::new(pool().await);
    let mut product = repo.insert(&draft(&unique("Widget"), 100, 1, None)).await.unwrap();
    product.stock = -1;

    assert!(matches!(
        repo.update(&product).await,
        Err(RepositoryError::Database(_))
    ));
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_adjust_stock_is_conditional() {
    let repo = PgProductRepository::new(pool().await);
    let product = repo.insert(&draft(&unique("Widget"), 100, 5, None)).await.unwrap();

    assert_eq!(repo.adjust_stock(product.id, -3).await.unwrap().stock, 2);
    assert!(matches!(
        repo.adjust_stock(product.id, -3).await,
        Err(RepositoryError::InsufficientStock)
    ));
    assert_eq!(repo.find_by_id(product.id).await.unwrap().unwrap().stock, 2);
    assert!(matches!(
        repo.adjust_stock(ProductId::new(i64::MAX), -1).await,
        Err(RepositoryError::NotFound)
    ));
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_concurrent_decrements_never_oversell() {
    let repo = Arc::new(PgProductRepository::new(pool().await));
    let product = repo.insert(&draft(&unique("Widget"), 100, 5, None)).await.unwrap();

    let take = |repo: Arc<PgProductRepository>| {
        tokio::spawn(async move { repo.adjust_stock(product.id, -3).await })
    };
    let (first, second) = tokio::join!(take(repo.clone()), take(repo.clone()));
    let results = [first.unwrap(), second.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(repo.find_by_id(product.id).await.unwrap().unwrap().stock, 2);
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_user_insert_and_conflict() {
    let repo = PgUserRepository::new(pool().await);
    let username = user(&unique("ana"));
    let new_user = NewUser {
        username: username.clone(),
        password_hash: "$argon2id$placeholder".to_owned(),
        roles: BTreeSet::from([Role::User]),
    };

    let created = repo.insert(&new_user).await.unwrap();
    assert_eq!(created.username, username);
    assert!(created.has_role(Role::User));
    assert_eq!(
        repo.find_by_username(&username).await.unwrap(),
        Some(created)
    );
    assert!(matches!(
        repo.insert(&new_user).await,
        Err(RepositoryError::Conflict(_))
    ));
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_purchase_against_postgres() {
    let pool = pool().await;
    let tier = ReplicatedCacheTier::standalone();
    let services = Services::new(
        Arc::new(PgProductRepository::new(pool.clone())),
        Arc::new(PgUserRepository::new(pool)),
        &tier,
        test_locks(),
    );
    let widget = services
        .catalog
        .create(&draft(&unique("Widget"), 400, 5, None))
        .await
        .unwrap();
    let bob = user(&unique("bob"));

    services.cart.add_product(&bob, widget.id, 2).await.unwrap();
    let receipt = services.purchase.purchase(&bob).await.unwrap();

    assert_eq!(receipt.lines[0].remaining_stock, 3);
    assert_eq!(
        services.catalog.find_fresh(widget.id).await.unwrap().unwrap().stock,
        3
    );
}
