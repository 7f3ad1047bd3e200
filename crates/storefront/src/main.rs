//! Shelf Storefront - catalog, cart, favorites and checkout service.
//!
//! This binary serves the JSON/SSE storefront API on port 3000.
//!
//! # Architecture
//!
//! - Axum web framework, JSON in and out
//! - `PostgreSQL` system of record (or the embedded store for `memory://`)
//! - Cache tier located through sentinel discovery: a shared Redis deployment
//!   when `CACHE_SENTINEL_URLS` is set, an embedded cluster otherwise
//! - Catalog snapshots broadcast to SSE subscribers after every write
//!
//! Authentication is handled upstream; per-user routes trust the
//! `x-authenticated-user` header.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::sync::Arc;

use secrecy::ExposeSecret;
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shelf_storefront::cache::{
    CacheTier, EmbeddedCluster, RedisCacheTier, RedisSettings, ReplicatedCacheTier, RoutingPolicy,
};
use shelf_storefront::config::{CacheBackend, StorefrontConfig};
use shelf_storefront::db::{
    self, MemoryStore, PgProductRepository, PgUserRepository, ProductRepository, UserRepository,
};
use shelf_storefront::routes;
use shelf_storefront::services::{AdminBootstrap, Services};
use shelf_storefront::state::AppState;

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &StorefrontConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            sample_rate: config.sentry_sample_rate,
            traces_sample_rate: config.sentry_traces_sample_rate,
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() {
    // Load configuration from environment (needed for Sentry init)
    let config = StorefrontConfig::from_env().expect("Failed to load configuration");

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);

    // Defaults to info level for our crate if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shelf_storefront=info,tower_http=debug".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    // System of record
    // NOTE: Migrations are NOT run automatically on startup.
    // Run them explicitly via: cargo run -p shelf-cli -- migrate
    let products: Arc<dyn ProductRepository>;
    let users: Arc<dyn UserRepository>;
    let pool = if config.uses_memory_store() {
        tracing::warn!("Using the embedded in-memory store; data is lost on exit");
        let store = Arc::new(MemoryStore::new());
        products = store.clone();
        users = store;
        None
    } else {
        let pool = db::create_pool(&config.database_url)
            .await
            .expect("Failed to create database pool");
        tracing::info!("Database pool created");
        products = Arc::new(PgProductRepository::new(pool.clone()));
        users = Arc::new(PgUserRepository::new(pool.clone()));
        Some(pool)
    };

    // Cache tier, located through the sentinels
    let policy = RoutingPolicy::new(config.cache.read_from);
    let (services, cache): (Services, Arc<dyn CacheTier>) = match &config.cache.backend {
        CacheBackend::Redis {
            sentinel_urls,
            service,
            refresh,
        } => {
            let tier = RedisCacheTier::connect(RedisSettings {
                sentinels: sentinel_urls.clone(),
                service: service.clone(),
                quorum: config.cache.quorum,
                policy,
            })
            .await
            .expect("Failed to connect to the Redis cache tier");
            let _refresh = tier.spawn_refresh(*refresh);
            let services = Services::new(products, users, &tier, config.cache.locks);
            (services, Arc::new(tier))
        }
        CacheBackend::Embedded => {
            tracing::warn!("Using the embedded cache tier; caches are private to this process");
            let cluster = EmbeddedCluster::new(config.cache.replicas, config.cache.sentinels);
            let discovery = cluster
                .discovery(config.cache.quorum)
                .expect("Invalid sentinel quorum");
            let tier = ReplicatedCacheTier::discover(discovery, policy, config.cache.replication)
                .expect("Failed to connect to the cache tier");
            let services = Services::new(products, users, &tier, config.cache.locks);
            (services, Arc::new(tier))
        }
    };

    if let Some(admin) = &config.admin {
        match services
            .users
            .ensure_admin(&admin.username, admin.password.expose_secret())
            .await
            .expect("Failed to bootstrap admin user")
        {
            AdminBootstrap::Created(user) => {
                tracing::info!(username = %user.username, "Bootstrap admin created");
            }
            AdminBootstrap::AlreadyExists => {
                tracing::info!(username = %admin.username, "Bootstrap admin already present");
            }
        }
    }

    let state = AppState::new(services, cache, pool);

    let app = routes::app(state)
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction());

    // Start server
    let addr = config.socket_addr();
    tracing::info!("storefront listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
