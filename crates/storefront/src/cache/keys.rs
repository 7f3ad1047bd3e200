//! Cache names and volatile key layout.
//!
//! | Key                      | Kind | Contents                         |
//! |--------------------------|------|----------------------------------|
//! | `cart:{username}`        | hash | product id -> quantity           |
//! | `favorites:{username}`   | set  | product ids                      |
//! | `lock:purchase:{username}` | lease | purchase in progress           |

use core::fmt;

use shelf_core::Username;

/// Key under which whole-collection caches store their single entry.
pub const ALL: &str = "all";

/// The named caches held by the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheName {
    /// Full product listing.
    AllProducts,
    /// One product snapshot per id.
    ProductById,
    /// Search results keyed by [`search_key`].
    FilteredProducts,
    /// Distinct category set.
    Categories,
    /// User snapshots keyed by username.
    Users,
}

impl CacheName {
    /// Product list caches that any catalog write must invalidate.
    pub const PRODUCT_LISTS: [Self; 3] = [Self::AllProducts, Self::FilteredProducts, Self::Categories];

    /// Every named cache.
    pub const ALL: [Self; 5] = [
        Self::AllProducts,
        Self::ProductById,
        Self::FilteredProducts,
        Self::Categories,
        Self::Users,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AllProducts => "products:all",
            Self::ProductById => "products:by-id",
            Self::FilteredProducts => "products:filtered",
            Self::Categories => "products:categories",
            Self::Users => "users",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a cached search, derived from both raw filter strings.
#[must_use]
pub fn search_key(name: &str, category: &str) -> String {
    format!("name={name}_category={category}")
}

#[must_use]
pub fn cart_key(username: &Username) -> String {
    format!("cart:{username}")
}

#[must_use]
pub fn favorites_key(username: &Username) -> String {
    format!("favorites:{username}")
}

#[must_use]
pub fn purchase_lock_key(username: &Username) -> String {
    format!("lock:purchase:{username}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_search_key_distinguishes_filters() {
        assert_eq!(search_key("wid", ""), "name=wid_category=");
        assert_ne!(search_key("a", "b"), search_key("b", "a"));
    }

    #[test]
    fn test_user_keys() {
        let bob = Username::parse("bob").unwrap();
        assert_eq!(cart_key(&bob), "cart:bob");
        assert_eq!(favorites_key(&bob), "favorites:bob");
        assert_eq!(purchase_lock_key(&bob), "lock:purchase:bob");
    }
}
