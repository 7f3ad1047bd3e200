//! Seed the catalog from a YAML file.
//!
//! ```yaml
//! products:
//!   - name: Widget
//!     price: "4.00"
//!     stock: 5
//!     category: Tools
//!   - name: Gadget
//!     price: "12.50"
//!     stock: 3
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

use shelf_storefront::cache::ReplicatedCacheTier;
use shelf_storefront::db::{self, PgProductRepository};
use shelf_storefront::models::ProductDraft;
use shelf_storefront::services::{ProductCache, StoreError};

/// Errors that can occur while seeding.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid catalog file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0} invalid products")]
    Invalid(usize),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Catalog file layout.
#[derive(Debug, Deserialize)]
pub struct CatalogFile {
    pub products: Vec<ProductDraft>,
}

/// Parse a catalog and report every invalid entry.
fn parse_catalog(content: &str) -> Result<CatalogFile, SeedError> {
    let catalog: CatalogFile = serde_yaml::from_str(content)?;

    let mut invalid = 0;
    for (index, draft) in catalog.products.iter().enumerate() {
        if let Err(e) = draft.validate() {
            error!("  - product #{} ({}): {e}", index + 1, draft.name);
            invalid += 1;
        }
    }
    if invalid > 0 {
        return Err(SeedError::Invalid(invalid));
    }
    Ok(catalog)
}

/// Insert every product in `file_path`.
///
/// The file is validated in full before connecting to the database.
pub async fn catalog(file_path: &str) -> Result<(), SeedError> {
    let path = Path::new(file_path);
    if !path.exists() {
        return Err(SeedError::FileNotFound(file_path.to_owned()));
    }

    info!(path = %file_path, "Loading catalog from file");
    let content = tokio::fs::read_to_string(path).await?;
    let catalog = parse_catalog(&content)?;
    info!(products = catalog.products.len(), "Catalog validated");

    let database_url =
        super::database_url().ok_or(SeedError::MissingEnvVar("STOREFRONT_DATABASE_URL"))?;
    let pool = db::create_pool(&database_url).await?;
    info!("Connected to database");

    let products = ProductCache::new(
        Arc::new(PgProductRepository::new(pool)),
        Arc::new(ReplicatedCacheTier::standalone()),
    );
    for draft in &catalog.products {
        let product = products.create(draft).await?;
        info!("  Inserted #{}: {}", product.id, product.name);
    }

    info!("Seeding complete! {} products inserted", catalog.products.len());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn test_parse_catalog() {
        let catalog = parse_catalog(
            r#"
products:
  - name: Widget
    price: "4.00"
    stock: 5
    category: Tools
  - name: Gadget
    price: "12.50"
    stock: 3
"#,
        )
        .unwrap();

        assert_eq!(catalog.products.len(), 2);
        assert_eq!(catalog.products[0].category.as_deref(), Some("Tools"));
        assert_eq!(Decimal::from(catalog.products[1].price), Decimal::new(1250, 2));
        assert!(catalog.products[1].image_url.is_none());
    }

    #[test]
    fn test_parse_catalog_rejects_invalid_products() {
        let result = parse_catalog(
            r#"
products:
  - name: ""
    price: "1.00"
    stock: 1
  - name: Widget
    price: "1.00"
    stock: -2
"#,
        );
        assert!(matches!(result, Err(SeedError::Invalid(2))));
    }

    #[test]
    fn test_parse_catalog_rejects_negative_price() {
        let result = parse_catalog(
            r#"
products:
  - name: Widget
    price: "-1.00"
    stock: 1
"#,
        );
        assert!(matches!(result, Err(SeedError::Yaml(_))));
    }
}
