use crate::domain::operation::{OperationId, OperationStatus, PendingOperation};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Which of the three concurrent activities settled a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The change feed reported a terminal status written by someone else.
    Push,
    /// The gateway status query reported a terminal state.
    Poll,
    Deadline,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Push => "push",
            Channel::Poll => "poll",
            Channel::Deadline => "deadline",
        };
        f.write_str(name)
    }
}

/// The terminal state a session settled on, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub channel: Channel,
    pub status: OperationStatus,
    pub detail: Option<String>,
}

/// Single-assignment cell holding a session's resolution. Only the first fill counts.
#[derive(Debug, Default)]
pub struct OutcomeSlot {
    cell: OnceLock<Resolution>,
    filled: Notify,
}

impl OutcomeSlot {
    /// Returns `true` if this call won the slot.
    pub fn fill(&self, resolution: Resolution) -> bool {
        if self.cell.set(resolution).is_err() {
            return false;
        }
        self.filled.notify_one();
        true
    }

    pub fn get(&self) -> Option<&Resolution> {
        self.cell.get()
    }

    pub async fn wait(&self) -> Resolution {
        loop {
            if let Some(resolution) = self.cell.get() {
                return resolution.clone();
            }
            // notify_one keeps a permit, so a fill between the check and here is not lost.
            self.filled.notified().await;
        }
    }
}

/// What each activity of a session gets: the shared slot and the shared stop signal.
#[derive(Debug, Clone)]
pub struct WatchContext {
    pub operation_id: OperationId,
    pub token: CancellationToken,
    slot: Arc<OutcomeSlot>,
}

impl WatchContext {
    /// Offers a record to the slot. Non-terminal records are ignored.
    pub fn settle(&self, channel: Channel, record: &PendingOperation) -> bool {
        if !record.is_terminal() {
            return false;
        }
        self.settle_status(channel, record.status, record.error_detail.clone())
    }

    pub fn settle_status(
        &self,
        channel: Channel,
        status: OperationStatus,
        detail: Option<String>,
    ) -> bool {
        let won = self.slot.fill(Resolution {
            channel,
            status,
            detail,
        });
        if !won {
            debug!(
                operation = %self.operation_id,
                %channel,
                "session already resolved, discarding result"
            );
        }
        won
    }
}

/// One confirmation session: up to three activities racing to fill one slot.
///
/// Dropping the session cancels and aborts whatever is still running.
pub struct ConfirmationSession {
    context: WatchContext,
    tasks: JoinSet<()>,
}

impl ConfirmationSession {
    pub fn new(operation_id: OperationId) -> Self {
        Self {
            context: WatchContext {
                operation_id,
                token: CancellationToken::new(),
                slot: Arc::new(OutcomeSlot::default()),
            },
            tasks: JoinSet::new(),
        }
    }

    pub fn context(&self) -> WatchContext {
        self.context.clone()
    }

    pub fn spawn<F>(&mut self, activity: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(activity);
    }

    /// Waits for the first resolution, then stops every activity before returning.
    ///
    /// `None` only if all activities ended without resolving, which the deadline
    /// activity never does unless it panicked.
    pub async fn resolve(mut self) -> Option<Resolution> {
        let resolution = tokio::select! {
            biased;
            resolution = self.context.slot.wait() => Some(resolution),
            _ = drain(&mut self.tasks) => self.context.slot.get().cloned(),
        };
        self.context.token.cancel();
        self.tasks.shutdown().await;
        resolution
    }
}

impl Drop for ConfirmationSession {
    fn drop(&mut self) {
        self.context.token.cancel();
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "confirmation activity panicked");
            }
        }
    }
}

/// Tracks which operations have a session running in this process.
///
/// The first caller leads; concurrent callers for the same id follow and are
/// woken when the leader's lease is dropped.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<OperationId, watch::Receiver<bool>>>,
}

pub enum Lease {
    Leader(LeaderLease),
    Follower(watch::Receiver<bool>),
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, id: &OperationId) -> Lease {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = active.get(id) {
            return Lease::Follower(done.clone());
        }
        let (sender, receiver) = watch::channel(false);
        active.insert(id.clone(), receiver);
        Lease::Leader(LeaderLease {
            registry: Arc::clone(self),
            operation_id: id.clone(),
            done: sender,
        })
    }

    pub fn is_active(&self, id: &OperationId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

/// Held by the session leader. Releasing it wakes every follower.
pub struct LeaderLease {
    registry: Arc<SessionRegistry>,
    operation_id: OperationId,
    done: watch::Sender<bool>,
}

impl Drop for LeaderLease {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.operation_id);
        self.done.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resolution(channel: Channel, status: OperationStatus) -> Resolution {
        Resolution {
            channel,
            status,
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_slot_keeps_first_fill() {
        let slot = OutcomeSlot::default();
        assert!(slot.fill(resolution(Channel::Poll, OperationStatus::Succeeded)));
        assert!(!slot.fill(resolution(Channel::Deadline, OperationStatus::TimedOut)));
        assert_eq!(slot.wait().await.channel, Channel::Poll);
    }

    #[tokio::test]
    async fn test_slot_wakes_waiter() {
        let slot = Arc::new(OutcomeSlot::default());
        let waiter = tokio::spawn({
            let slot = slot.clone();
            async move { slot.wait().await }
        });
        tokio::task::yield_now().await;
        slot.fill(resolution(Channel::Push, OperationStatus::Cancelled));
        assert_eq!(waiter.await.unwrap().status, OperationStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_stops_losers() {
        let mut session = ConfirmationSession::new(OperationId::from("op-s"));
        let ctx = session.context();
        let loser_ctx = session.context();
        session.spawn(async move {
            ctx.settle_status(Channel::Poll, OperationStatus::Succeeded, None);
        });
        session.spawn(async move {
            loser_ctx.token.cancelled().await;
        });
        let token = session.context().token;

        let resolved = session.resolve().await.unwrap();
        assert_eq!(resolved.channel, Channel::Poll);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_without_winner() {
        let mut session = ConfirmationSession::new(OperationId::from("op-empty"));
        session.spawn(tokio::time::sleep(Duration::from_millis(5)));
        assert!(session.resolve().await.is_none());
    }

    #[tokio::test]
    async fn test_follower_woken_when_leader_leaves() {
        let registry = Arc::new(SessionRegistry::new());
        let id = OperationId::from("op-lease");
        let leader = match registry.acquire(&id) {
            Lease::Leader(lease) => lease,
            Lease::Follower(_) => panic!("first caller must lead"),
        };
        let mut follower = match registry.acquire(&id) {
            Lease::Follower(done) => done,
            Lease::Leader(_) => panic!("second caller must follow"),
        };
        assert!(registry.is_active(&id));

        drop(leader);
        follower.wait_for(|done| *done).await.unwrap();
        assert!(!registry.is_active(&id));
        assert!(matches!(registry.acquire(&id), Lease::Leader(_)));
    }
}
