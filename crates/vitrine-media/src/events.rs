//! Completion events: best-effort fanout to subscribed clients.
//!
//! The optimization worker publishes one [`ImageOptimized`] event per fully
//! completed job; interested clients subscribe and invalidate their cached
//! view of the model. Semantics are deliberately weak:
//!
//! - **At-most-once per subscriber**: no buffering for periods with no
//!   subscriber attached, no durable log
//! - **Lag skips, not errors**: a slow subscriber that falls behind the
//!   channel capacity loses the oldest events (logged at WARN) and keeps
//!   receiving
//!
//! Clients needing ground truth re-read the ledger; the event stream is an
//! invalidation hint, not a source of record.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use vitrine_core::ImageId;

use crate::types::ModelRef;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Published when every rendition of an image has been persisted and
/// uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOptimized {
    /// The model the image belongs to (id + slug, as subscribers key their
    /// cache invalidation by slug).
    pub model: ModelRef,
    /// The image whose renditions are ready.
    pub image_id: ImageId,
}

/// Process-wide completion event bus.
///
/// Cheap to clone; all clones share the same channel. Inject by reference
/// into the worker (publisher) and the service (subscriber side).
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ImageOptimized>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Returns the number of subscribers that will observe it. Zero is not
    /// an error: publishing with nobody attached is expected.
    pub fn publish(&self, event: ImageOptimized) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => 0,
        }
    }

    /// Registers a new subscriber.
    ///
    /// The subscription observes only events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns the current subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live subscription to completion events.
///
/// Dropping the subscription releases its registration immediately.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ImageOptimized>,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Returns `None` once the bus is closed (all publishers dropped).
    /// Lagged deliveries are skipped with a warning rather than surfaced
    /// as errors.
    pub async fn recv(&mut self) -> Option<ImageOptimized> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
