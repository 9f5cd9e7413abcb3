use super::operation::{OperationId, OperationStatus};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// A status change published by a store whenever a record's status is written.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub operation_id: OperationId,
    pub status: OperationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    Status(OperationStatus),
    /// Events were dropped because this subscriber fell behind; re-read the record.
    Lagged,
}

/// A live subscription to status changes of one operation.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    operation_id: OperationId,
    receiver: Option<broadcast::Receiver<StatusChange>>,
}

impl Subscription {
    pub fn new(operation_id: OperationId, receiver: broadcast::Receiver<StatusChange>) -> Self {
        Self {
            operation_id,
            receiver: Some(receiver),
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Waits for the next event concerning this operation.
    ///
    /// Returns `None` once unsubscribed or when the feed itself is closed.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(change) if change.operation_id == self.operation_id => {
                    return Some(FeedEvent::Status(change.status));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(operation = %self.operation_id, skipped, "change feed lagged");
                    return Some(FeedEvent::Lagged);
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Stops delivery. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        self.receiver.take();
    }
}
