use crate::domain::feed::{StatusChange, Subscription};
use crate::domain::operation::{OperationId, PendingOperation};
use crate::domain::ports::ChangeFeed;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

/// In-process change feed backed by a `tokio::sync::broadcast` channel.
///
/// Stores hold a clone and publish after every status write. Subscribers filter by id.
#[derive(Clone, Debug)]
pub struct BroadcastChangeFeed {
    sender: broadcast::Sender<StatusChange>,
}

impl BroadcastChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, operation: &PendingOperation) {
        let change = StatusChange {
            operation_id: operation.id.clone(),
            status: operation.status,
        };
        // No subscribers is fine; the change is durable in the store.
        if self.sender.send(change).is_err() {
            trace!(operation = %operation.id, "status change published with no subscribers");
        }
    }

    /// Number of live subscriptions across all operations.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChangeFeed for BroadcastChangeFeed {
    async fn subscribe(&self, id: &OperationId) -> Result<Subscription> {
        Ok(Subscription::new(id.clone(), self.sender.subscribe()))
    }
}
