//! Server-Sent Events stream of catalog updates.

use std::convert::Infallible;

use async_stream::stream;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::services::{PRODUCTS_TOPIC, UpdateNotification};
use crate::state::AppState;

/// Stream every catalog snapshot published after the client connects.
///
/// GET /topic/products
///
/// Slow clients that fall behind skip the missed snapshots; the next one
/// carries the full catalog anyway.
pub async fn products(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut updates = state.services().updates.subscribe(PRODUCTS_TOPIC);

    let events = stream! {
        loop {
            match updates.recv().await {
                Ok(payload) => {
                    match Event::default()
                        .event(UpdateNotification::PRODUCT_UPDATE)
                        .json_data(&*payload)
                    {
                        Ok(event) => yield Ok(event),
                        Err(e) => warn!(error = %e, "Failed to encode catalog update"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscriber lagged behind catalog updates");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}
