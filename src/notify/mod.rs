use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::notification::Notification;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Fire-and-forget publisher. Callers log failures; they never undo the
/// state change that produced the event.
#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    async fn publish(&self, notification: Notification) -> Result<(), DispatchError>;
}

/// Publishes onto an in-process broadcast channel that the websocket and SSE
/// endpoints subscribe to.
#[derive(Clone)]
pub struct BroadcastDispatch {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastDispatch {
    pub fn new(tx: broadcast::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationDispatch for BroadcastDispatch {
    async fn publish(&self, notification: Notification) -> Result<(), DispatchError> {
        let receiver_id = notification.receiver_id;
        if self.tx.send(notification).is_err() {
            // nobody is listening right now
            debug!(receiver_id = %receiver_id, "no subscribers for notification");
        }
        Ok(())
    }
}
