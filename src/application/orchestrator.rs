use super::completion::{CompletionAction, RetryPolicy, run_with_retry};
use super::poller::{PollPolicy, PollWatcher};
use super::session::{Channel, ConfirmationSession, Lease, SessionRegistry, WatchContext};
use crate::config::ConfirmConfig;
use crate::domain::feed::{FeedEvent, Subscription};
use crate::domain::operation::{CompletionMark, OperationId, OperationStatus, PendingOperation};
use crate::domain::outcome::Outcome;
use crate::domain::ports::{ChangeFeedRef, OperationStoreRef, PushGatewayRef, StatusGatewayRef};
use crate::error::{ConfirmError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, error, info, warn};

const DEADLINE_DETAIL: &str = "no confirmation before deadline";
const PAYER_CANCELLED_DETAIL: &str = "cancelled by payer";

/// What a caller-initiated cancel achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelDisposition {
    /// The record is now cancelled.
    Cancelled,
    /// The record had already settled; nothing changed.
    AlreadyTerminal(Outcome),
    /// The gateway did not confirm the cancel. The confirmation keeps running
    /// until it resolves or times out.
    StillRunning,
}

/// Drives a pending operation to exactly one terminal outcome.
///
/// Each confirmation races three activities against one deadline: the change
/// feed (push), a gateway status poll (pull) and a timer. The first terminal
/// result wins; the other two are cancelled before anything else happens.
pub struct ConfirmationOrchestrator {
    store: OperationStoreRef,
    feed: ChangeFeedRef,
    status_gateway: StatusGatewayRef,
    push_gateway: Option<PushGatewayRef>,
    sessions: Arc<SessionRegistry>,
    poll_policy: PollPolicy,
    retry_policy: RetryPolicy,
}

impl ConfirmationOrchestrator {
    pub fn new(
        store: OperationStoreRef,
        feed: ChangeFeedRef,
        status_gateway: StatusGatewayRef,
        config: &ConfirmConfig,
    ) -> Self {
        Self {
            store,
            feed,
            status_gateway,
            push_gateway: None,
            sessions: Arc::new(SessionRegistry::new()),
            poll_policy: PollPolicy::from(config),
            retry_policy: RetryPolicy::from(config),
        }
    }

    /// Enables [`cancel`](Self::cancel) to ask the gateway to withdraw a sent prompt.
    pub fn with_push_gateway(mut self, push_gateway: PushGatewayRef) -> Self {
        self.push_gateway = Some(push_gateway);
        self
    }

    /// Resolves the operation, running `on_success` once if the payment succeeded.
    ///
    /// Calling this again for a settled operation returns the stored outcome
    /// without any gateway traffic. Concurrent calls for the same operation share
    /// one session.
    ///
    /// # Arguments
    ///
    /// * `operation_id` - The record to confirm.
    /// * `deadline` - Wall-clock bound, counted from this call.
    /// * `on_success` - Completion action for a succeeded payment.
    pub async fn confirm(
        &self,
        operation_id: &OperationId,
        deadline: Duration,
        on_success: &dyn CompletionAction,
    ) -> Result<Outcome> {
        let expires_at = Instant::now() + deadline;
        loop {
            let operation = self.load(operation_id).await?;
            if operation.is_terminal() {
                return self.settled(operation, on_success).await;
            }

            match self.sessions.acquire(operation_id) {
                Lease::Leader(_lease) => {
                    return self.run_session(operation, expires_at, on_success).await;
                }
                Lease::Follower(mut done) => {
                    debug!(operation = %operation_id, "joining running confirmation");
                    let joined = timeout_at(expires_at, async {
                        done.wait_for(|finished| *finished).await.map(|_| ())
                    })
                    .await;
                    if joined.is_err() {
                        info!(
                            operation = %operation_id,
                            "deadline passed while waiting on running confirmation"
                        );
                        return Ok(Outcome::TimedOut);
                    }
                }
            }
        }
    }

    /// Cancels the operation on the caller's behalf.
    ///
    /// A record whose prompt never went out is cancelled directly. Otherwise
    /// the gateway must confirm the cancel first.
    pub async fn cancel(&self, operation_id: &OperationId) -> Result<CancelDisposition> {
        let operation = self.load(operation_id).await?;
        if let Some(outcome) = Outcome::of(&operation) {
            return Ok(CancelDisposition::AlreadyTerminal(outcome));
        }

        let confirmed = match (&operation.gateway_correlation_id, &self.push_gateway) {
            (None, _) if operation.status == OperationStatus::Pending => true,
            (Some(correlation), Some(gateway)) => match gateway.cancel_push(correlation).await {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    warn!(operation = %operation_id, error = %e, "gateway cancel failed");
                    false
                }
            },
            _ => false,
        };
        if !confirmed {
            info!(operation = %operation_id, "cancel not confirmed, confirmation keeps running");
            return Ok(CancelDisposition::StillRunning);
        }

        let transition = self
            .store
            .transition(
                operation_id,
                OperationStatus::Cancelled,
                Some(PAYER_CANCELLED_DETAIL.to_string()),
            )
            .await?;
        if transition.applied() {
            info!(operation = %operation_id, "operation cancelled");
            return Ok(CancelDisposition::Cancelled);
        }
        Outcome::of(transition.record())
            .map(CancelDisposition::AlreadyTerminal)
            .ok_or_else(|| ConfirmError::InvalidTransition {
                id: operation_id.clone(),
                from: transition.record().status,
                to: OperationStatus::Cancelled,
            })
    }

    async fn load(&self, operation_id: &OperationId) -> Result<PendingOperation> {
        self.store
            .get(operation_id)
            .await?
            .ok_or_else(|| ConfirmError::NotFound(operation_id.clone()))
    }

    /// Outcome of an already terminal record, finishing a completion nobody applied.
    async fn settled(
        &self,
        operation: PendingOperation,
        on_success: &dyn CompletionAction,
    ) -> Result<Outcome> {
        let outcome = Outcome::of(&operation).ok_or_else(|| unsettled(&operation.id))?;
        if outcome == Outcome::Succeeded && operation.completion.is_claimable() {
            self.complete(&operation.id, on_success).await?;
        }
        Ok(outcome)
    }

    async fn run_session(
        &self,
        operation: PendingOperation,
        expires_at: Instant,
        on_success: &dyn CompletionAction,
    ) -> Result<Outcome> {
        let id = operation.id.clone();
        let subscription = self.feed.subscribe(&id).await?;
        // A write between the first read and the subscription would never reach
        // the feed; read again now that we are listening.
        let operation = self.load(&id).await?;
        if operation.is_terminal() {
            return self.settled(operation, on_success).await;
        }

        info!(
            operation = %id,
            kind = %operation.kind,
            status = %operation.status,
            "confirmation started"
        );
        let mut session = ConfirmationSession::new(id.clone());
        session.spawn(watch_feed(self.store.clone(), subscription, session.context()));
        session.spawn(
            PollWatcher {
                store: self.store.clone(),
                gateway: self.status_gateway.clone(),
                policy: self.poll_policy.clone(),
            }
            .run(operation.gateway_correlation_id.clone(), session.context()),
        );
        session.spawn(deadline_timer(self.store.clone(), expires_at, session.context()));

        let resolution = session.resolve().await.ok_or_else(|| unsettled(&id))?;
        let outcome = Outcome::from_status(resolution.status, resolution.detail.as_deref())
            .ok_or_else(|| unsettled(&id))?;
        info!(
            operation = %id,
            channel = %resolution.channel,
            %outcome,
            "confirmation resolved"
        );

        if outcome == Outcome::Succeeded {
            self.complete(&id, on_success).await?;
        }
        Ok(outcome)
    }

    /// Runs the completion action under the durable claim, so it happens at most
    /// once no matter how many callers saw the success.
    async fn complete(
        &self,
        operation_id: &OperationId,
        on_success: &dyn CompletionAction,
    ) -> Result<()> {
        let operation = self.load(operation_id).await?;
        if !self.store.claim_completion(operation_id).await? {
            debug!(operation = %operation_id, "completion already claimed");
            return Ok(());
        }
        let claim = ClaimGuard {
            store: self.store.clone(),
            operation_id: operation_id.clone(),
            armed: true,
        };
        let result = run_with_retry(&self.retry_policy, || on_success.complete(&operation)).await;
        claim.disarm();

        match result {
            Ok(attempts) => {
                if let Err(e) = self
                    .store
                    .settle_completion(operation_id, CompletionMark::Applied)
                    .await
                {
                    error!(
                        operation = %operation_id,
                        error = %e,
                        "completion applied but not recorded"
                    );
                } else {
                    info!(operation = %operation_id, attempts, "completion applied");
                }
                Ok(())
            }
            Err(failure) => {
                error!(
                    operation = %operation_id,
                    kind = %operation.kind,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "payment succeeded but completion failed, needs reconciliation"
                );
                if let Err(e) = self
                    .store
                    .settle_completion(operation_id, CompletionMark::Abandoned)
                    .await
                {
                    error!(
                        operation = %operation_id,
                        error = %e,
                        "could not release completion claim"
                    );
                }
                Err(ConfirmError::CompletionActionFailed {
                    operation: operation_id.clone(),
                    attempts: failure.attempts,
                    reason: failure.error.to_string(),
                })
            }
        }
    }
}

/// Releases a completion claim as abandoned when its holder goes away without
/// settling it (the action panicked or the confirm future was dropped).
struct ClaimGuard {
    store: OperationStoreRef,
    operation_id: OperationId,
    armed: bool,
}

impl ClaimGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            error!(
                operation = %self.operation_id,
                "completion claim left held, no runtime to release it"
            );
            return;
        };
        warn!(operation = %self.operation_id, "completion interrupted, releasing claim");
        let store = self.store.clone();
        let id = self.operation_id.clone();
        runtime.spawn(async move {
            if let Err(e) = store.settle_completion(&id, CompletionMark::Abandoned).await {
                error!(operation = %id, error = %e, "could not release completion claim");
            }
        });
    }
}

fn unsettled(id: &OperationId) -> ConfirmError {
    ConfirmError::InternalError(format!("confirmation of {id} ended without an outcome").into())
}

/// The push channel: waits for a terminal status on the change feed.
///
/// The record is re-read on a terminal event (for its detail) and after a lag
/// (the terminal event may be among those dropped).
async fn watch_feed(
    store: OperationStoreRef,
    mut subscription: Subscription,
    ctx: WatchContext,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            event = subscription.next() => event,
        };
        let reread = match event {
            Some(FeedEvent::Status(status)) => status.is_terminal(),
            Some(FeedEvent::Lagged) => true,
            None => {
                debug!(operation = %ctx.operation_id, "change feed closed");
                break;
            }
        };
        if !reread {
            continue;
        }
        match store.get(&ctx.operation_id).await {
            Ok(Some(record)) if record.is_terminal() => {
                ctx.settle(Channel::Push, &record);
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(operation = %ctx.operation_id, error = %e, "record re-read failed"),
        }
    }
    subscription.unsubscribe();
}

/// Marks the record timed out once the deadline passes, unless someone settled it first.
async fn deadline_timer(store: OperationStoreRef, expires_at: Instant, ctx: WatchContext) {
    tokio::select! {
        biased;
        _ = ctx.token.cancelled() => return,
        _ = sleep_until(expires_at) => {}
    }
    match store
        .transition(
            &ctx.operation_id,
            OperationStatus::TimedOut,
            Some(DEADLINE_DETAIL.to_string()),
        )
        .await
    {
        Ok(transition) => {
            ctx.settle(Channel::Deadline, transition.record());
        }
        Err(e) => {
            // The caller still gets an answer by the deadline.
            warn!(operation = %ctx.operation_id, error = %e, "could not record timeout");
            ctx.settle_status(
                Channel::Deadline,
                OperationStatus::TimedOut,
                Some(DEADLINE_DETAIL.to_string()),
            );
        }
    }
}
