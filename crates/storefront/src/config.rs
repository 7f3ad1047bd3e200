//! Storefront configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `STOREFRONT_DATABASE_URL` - `PostgreSQL` connection string, or `memory://`
//!   for the embedded store (falls back to `DATABASE_URL`)
//!
//! ## Optional
//! - `STOREFRONT_HOST` - Bind address (default: 127.0.0.1)
//! - `STOREFRONT_PORT` - Listen port (default: 3000)
//! - `STOREFRONT_ADMIN_USERNAME` / `STOREFRONT_ADMIN_PASSWORD` - Bootstrap admin
//! - `CACHE_SENTINEL_URLS` - Comma-separated Redis Sentinel URLs; when set the
//!   cache tier is the shared Redis deployment they monitor, otherwise an
//!   embedded in-process cluster
//! - `CACHE_SERVICE_NAME` - Service the Redis sentinels monitor (default: shelf)
//! - `CACHE_REFRESH_SECS` - Redis topology refresh interval (default: 10)
//! - `CACHE_REPLICAS` - Replica nodes in the embedded cluster (default: 2)
//! - `CACHE_READ_FROM` - `primary` or `replica-preferred` (default)
//! - `CACHE_REPLICATION` - `async` (default) or `sync`
//! - `CACHE_SENTINELS` - Sentinels watching the embedded cluster (default: 3)
//! - `CACHE_SENTINEL_QUORUM` - Sentinels that must agree (default: 2)
//! - `CACHE_LOCK_TTL_MS` - Purchase lease TTL (default: 5000)
//! - `CACHE_LOCK_WAIT_MS` - Purchase lease wait budget (default: 2000)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name
//! - `SENTRY_SAMPLE_RATE` - Error sample rate (default: 1.0)
//! - `SENTRY_TRACES_SAMPLE_RATE` - Transaction sample rate (default: 0.0)

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use shelf_core::Username;

use crate::cache::{ReadFrom, ReplicationMode};
use crate::services::LockSettings;

/// `STOREFRONT_DATABASE_URL` value selecting the embedded store.
pub const MEMORY_DATABASE_URL: &str = "memory://";

const MIN_ADMIN_PASSWORD_LENGTH: usize = 12;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.0;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Storefront application configuration.
#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Cache tier topology and routing
    pub cache: CacheConfig,
    /// Administrator created at startup when absent
    pub admin: Option<AdminConfig>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
    /// Fraction of errors sent to Sentry
    pub sentry_sample_rate: f32,
    /// Fraction of transactions sent to Sentry
    pub sentry_traces_sample_rate: f32,
}

/// Which cache tier implementation serves the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    /// An in-process cluster, private to this process.
    Embedded,
    /// A Redis deployment shared by every process, found through sentinels.
    Redis {
        sentinel_urls: Vec<String>,
        service: String,
        refresh: Duration,
    },
}

/// Cache tier configuration.
///
/// `replicas`, `replication` and `sentinels` shape the embedded cluster only.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub replicas: usize,
    pub read_from: ReadFrom,
    pub replication: ReplicationMode,
    pub sentinels: usize,
    pub quorum: usize,
    pub locks: LockSettings,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Embedded,
            replicas: 2,
            read_from: ReadFrom::default(),
            replication: ReplicationMode::default(),
            sentinels: 3,
            quorum: 2,
            locks: LockSettings::default(),
        }
    }
}

/// Bootstrap administrator credentials.
///
/// Implements `Debug` manually to redact the password.
#[derive(Clone)]
pub struct AdminConfig {
    pub username: Username,
    pub password: SecretString,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl StorefrontConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if the admin password fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("STOREFRONT_DATABASE_URL")?;
        let host = parse_env::<IpAddr>("STOREFRONT_HOST", "127.0.0.1")?;
        let port = parse_env::<u16>("STOREFRONT_PORT", "3000")?;
        let cache = CacheConfig::from_env()?;
        let admin = AdminConfig::from_env()?;

        Ok(Self {
            database_url,
            host,
            port,
            cache,
            admin,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
            sentry_sample_rate: parse_env("SENTRY_SAMPLE_RATE", "1.0")?,
            sentry_traces_sample_rate: parse_env("SENTRY_TRACES_SAMPLE_RATE", "0.0")?,
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Whether the embedded in-memory store was selected.
    #[must_use]
    pub fn uses_memory_store(&self) -> bool {
        self.database_url.expose_secret() == MEMORY_DATABASE_URL
    }
}

impl CacheConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let backend = match get_optional_env("CACHE_SENTINEL_URLS") {
            Some(raw) => CacheBackend::Redis {
                sentinel_urls: parse_sentinel_urls(&raw)?,
                service: get_env_or_default("CACHE_SERVICE_NAME", "shelf"),
                refresh: Duration::from_secs(parse_env("CACHE_REFRESH_SECS", "10")?),
            },
            None => CacheBackend::Embedded,
        };
        let (sentinels, bound) = match &backend {
            CacheBackend::Redis { sentinel_urls, .. } => (sentinel_urls.len(), "CACHE_SENTINEL_URLS"),
            CacheBackend::Embedded => (parse_env::<usize>("CACHE_SENTINELS", "3")?, "CACHE_SENTINELS"),
        };
        let quorum = parse_env::<usize>("CACHE_SENTINEL_QUORUM", "2")?;
        if quorum == 0 || quorum > sentinels {
            return Err(ConfigError::InvalidEnvVar(
                "CACHE_SENTINEL_QUORUM".to_string(),
                format!("must be between 1 and the {sentinels} sentinels of {bound}"),
            ));
        }

        Ok(Self {
            backend,
            replicas: parse_env("CACHE_REPLICAS", "2")?,
            read_from: parse_env("CACHE_READ_FROM", "replica-preferred")?,
            replication: parse_env("CACHE_REPLICATION", "async")?,
            sentinels,
            quorum,
            locks: LockSettings {
                ttl: Duration::from_millis(parse_env("CACHE_LOCK_TTL_MS", "5000")?),
                wait: Duration::from_millis(parse_env("CACHE_LOCK_WAIT_MS", "2000")?),
            },
        })
    }
}

impl AdminConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let (Some(username), Some(password)) = (
            get_optional_env("STOREFRONT_ADMIN_USERNAME"),
            get_optional_env("STOREFRONT_ADMIN_PASSWORD"),
        ) else {
            return Ok(None);
        };

        let username = Username::parse(&username).map_err(|e| {
            ConfigError::InvalidEnvVar("STOREFRONT_ADMIN_USERNAME".to_string(), e.to_string())
        })?;
        validate_admin_password(&password, "STOREFRONT_ADMIN_PASSWORD")?;

        Ok(Some(Self {
            username,
            password: SecretString::from(password),
        }))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar(primary_key.to_string()))
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset.
fn parse_env<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env_or_default(key, default)
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// Split `CACHE_SENTINEL_URLS`, requiring at least one `redis://` URL.
fn parse_sentinel_urls(raw: &str) -> Result<Vec<String>, ConfigError> {
    let urls: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_owned)
        .collect();
    if urls.is_empty() {
        return Err(ConfigError::InvalidEnvVar(
            "CACHE_SENTINEL_URLS".to_string(),
            "must list at least one sentinel".to_string(),
        ));
    }
    if let Some(bad) = urls
        .iter()
        .find(|url| !url.starts_with("redis://") && !url.starts_with("rediss://"))
    {
        return Err(ConfigError::InvalidEnvVar(
            "CACHE_SENTINEL_URLS".to_string(),
            format!("{bad:?} is not a redis:// URL"),
        ));
    }
    Ok(urls)
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Reject short, placeholder-looking or low-entropy admin passwords.
fn validate_admin_password(password: &str, var_name: &str) -> Result<(), ConfigError> {
    if password.chars().count() < MIN_ADMIN_PASSWORD_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!("must be at least {MIN_ADMIN_PASSWORD_LENGTH} characters"),
        ));
    }

    let lower = password.to_lowercase();
    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(password);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1})"
            ),
        ));
    }

    Ok(())
}
