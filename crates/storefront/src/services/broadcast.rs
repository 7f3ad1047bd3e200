//! Catalog change notifications.
//!
//! Every catalog write is followed by a snapshot of the full product list,
//! read straight from the system of record and published on
//! [`PRODUCTS_TOPIC`]. Delivery is fire-and-forget: subscribers that are
//! not listening at publish time miss the message.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use super::StoreError;
use crate::db::ProductRepository;
use crate::models::Product;

/// The single topic catalog updates are published on.
pub const PRODUCTS_TOPIC: &str = "/topic/products";

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 64;

/// Payload published after a catalog change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub products: Vec<Product>,
    pub published_at: DateTime<Utc>,
}

impl UpdateNotification {
    pub const PRODUCT_UPDATE: &'static str = "PRODUCT_UPDATE";

    #[must_use]
    pub fn product_update(products: Vec<Product>) -> Self {
        Self {
            kind: Self::PRODUCT_UPDATE.to_owned(),
            products,
            published_at: Utc::now(),
        }
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Publish `payload` on `topic`, returning how many subscribers got it.
    /// Zero subscribers is not an error.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> usize;
}

/// In-process transport backed by one tokio broadcast channel per topic.
#[derive(Default)]
pub struct ChannelTransport {
    topics: DashMap<String, broadcast::Sender<Arc<serde_json::Value>>>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive everything published on `topic` from now on.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<serde_json::Value>> {
        self.sender(topic).subscribe()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Arc<serde_json::Value>> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl BroadcastTransport for ChannelTransport {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        // send only fails when nobody is subscribed
        self.sender(topic).send(Arc::new(payload)).unwrap_or(0)
    }
}

/// Publishes catalog snapshots after writes.
#[derive(Clone)]
pub struct UpdateBroadcaster {
    products: Arc<dyn ProductRepository>,
    transport: Arc<dyn BroadcastTransport>,
}

impl UpdateBroadcaster {
    #[must_use]
    pub fn new(
        products: Arc<dyn ProductRepository>,
        transport: Arc<dyn BroadcastTransport>,
    ) -> Self {
        Self {
            products,
            transport,
        }
    }

    /// Publish the current product list, bypassing every cache.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the system of record cannot be read.
    #[instrument(skip(self))]
    pub async fn notify_update(&self) -> Result<usize, StoreError> {
        let products = self.products.find_all().await?;
        let count = products.len();
        let payload = serde_json::to_value(UpdateNotification::product_update(products))?;
        let delivered = self.transport.publish(PRODUCTS_TOPIC, payload).await;
        debug!(products = count, delivered, "Published catalog update");
        Ok(delivered)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;
    use shelf_core::Price;

    use super::*;
    use crate::db::MemoryStore;
    use crate::models::ProductDraft;

    fn draft(name: &str) -> ProductDraft {
        ProductDraft {
            name: name.to_owned(),
            price: Price::new(Decimal::ONE).unwrap(),
            stock: 1,
            category: None,
            image_url: None,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let transport = ChannelTransport::new();
        assert_eq!(
            transport
                .publish(PRODUCTS_TOPIC, serde_json::json!({}))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_notification_reads_system_of_record() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ChannelTransport::new());
        let broadcaster = UpdateBroadcaster::new(store.clone(), transport.clone());
        let mut rx = transport.subscribe(PRODUCTS_TOPIC);

        ProductRepository::insert(&*store, &draft("Widget"))
            .await
            .unwrap();
        assert_eq!(broadcaster.notify_update().await.unwrap(), 1);

        let message = rx.recv().await.unwrap();
        let notification: UpdateNotification =
            serde_json::from_value((*message).clone()).unwrap();
        assert_eq!(notification.kind, "PRODUCT_UPDATE");
        assert_eq!(notification.products.len(), 1);
        assert_eq!(notification.products[0].name, "Widget");
        assert_eq!(message["type"], "PRODUCT_UPDATE");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let transport = ChannelTransport::new();
        let mut other = transport.subscribe("/topic/other");
        transport
            .publish(PRODUCTS_TOPIC, serde_json::json!({"n": 1}))
            .await;
        assert!(other.try_recv().is_err());
    }
}
