use super::session::{Channel, WatchContext};
use crate::config::ConfirmConfig;
use crate::domain::gateway::{CorrelationId, GatewayReport, GatewayState};
use crate::domain::operation::OperationStatus;
use crate::domain::ports::{OperationStoreRef, StatusGatewayRef};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Ticks spent re-reading the record while it has no correlation id.
    pub correlation_lookup_attempts: u32,
    pub request_timeout: Duration,
}

impl From<&ConfirmConfig> for PollPolicy {
    fn from(config: &ConfirmConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            correlation_lookup_attempts: config.correlation_lookup_attempts,
            request_timeout: config.gateway_request_timeout(),
        }
    }
}

/// How one status report bears on the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    StillPending,
    Succeeded,
    Cancelled(Option<String>),
    Failed(String),
}

impl PollVerdict {
    pub fn from_report(report: &GatewayReport) -> Self {
        let detail = report.detail.clone();
        match report.state {
            GatewayState::Queued
            | GatewayState::AwaitingAuthorization
            | GatewayState::Processing
            | GatewayState::Unknown => PollVerdict::StillPending,
            GatewayState::Completed => PollVerdict::Succeeded,
            GatewayState::CancelledByPayer | GatewayState::Declined => {
                PollVerdict::Cancelled(detail)
            }
            GatewayState::InsufficientFunds => {
                PollVerdict::Failed(detail.unwrap_or_else(|| "insufficient funds".to_string()))
            }
            GatewayState::Expired => PollVerdict::Failed(
                detail.unwrap_or_else(|| "payment request expired".to_string()),
            ),
            GatewayState::Failed => PollVerdict::Failed(
                detail.unwrap_or_else(|| "payment failed at gateway".to_string()),
            ),
        }
    }

    /// The status write this verdict calls for, if any.
    pub fn terminal_status(self) -> Option<(OperationStatus, Option<String>)> {
        match self {
            PollVerdict::StillPending => None,
            PollVerdict::Succeeded => Some((OperationStatus::Succeeded, None)),
            PollVerdict::Cancelled(detail) => Some((OperationStatus::Cancelled, detail)),
            PollVerdict::Failed(detail) => Some((OperationStatus::Failed, Some(detail))),
        }
    }
}

enum Lookup {
    Found(CorrelationId),
    Settled,
    Missing,
}

/// The pull channel of a session: queries the gateway on a fixed cadence.
pub struct PollWatcher {
    pub store: OperationStoreRef,
    pub gateway: StatusGatewayRef,
    pub policy: PollPolicy,
}

impl PollWatcher {
    /// Polls until a terminal verdict is written or the session is cancelled.
    ///
    /// Without a correlation id the record is re-read on each tick. After
    /// `correlation_lookup_attempts` misses the watcher gives up and leaves the
    /// session to the feed and the deadline.
    pub async fn run(self, known: Option<CorrelationId>, ctx: WatchContext) {
        let id = ctx.operation_id.clone();
        let mut ticker = interval_at(Instant::now() + self.policy.interval, self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut correlation = known;
        let mut lookups = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = ctx.token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let correlation_id = match correlation.clone() {
                Some(c) => c,
                None => match self.lookup(&ctx).await {
                    Lookup::Found(c) => {
                        debug!(operation = %id, correlation = %c, "correlation id appeared");
                        correlation = Some(c.clone());
                        c
                    }
                    Lookup::Settled => return,
                    Lookup::Missing => {
                        lookups += 1;
                        if lookups >= self.policy.correlation_lookup_attempts {
                            info!(operation = %id, lookups, "no correlation id, polling stops");
                            return;
                        }
                        continue;
                    }
                },
            };

            let report = match timeout(
                self.policy.request_timeout,
                self.gateway.query(&correlation_id),
            )
            .await
            {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    warn!(operation = %id, error = %e, "status query failed, treating as pending");
                    continue;
                }
                Err(_) => {
                    warn!(operation = %id, "status query timed out, treating as pending");
                    continue;
                }
            };

            let Some((status, detail)) = PollVerdict::from_report(&report).terminal_status() else {
                debug!(operation = %id, state = ?report.state, "still pending");
                continue;
            };
            match self.store.transition(&id, status, detail).await {
                Ok(transition) => {
                    // A rejected write means another writer got there first; its
                    // status is what the session reports.
                    ctx.settle(Channel::Poll, transition.record());
                    return;
                }
                Err(e) => warn!(operation = %id, error = %e, "could not record polled status"),
            }
        }
    }

    async fn lookup(&self, ctx: &WatchContext) -> Lookup {
        match self.store.get(&ctx.operation_id).await {
            Ok(Some(record)) if record.is_terminal() => {
                ctx.settle(Channel::Poll, &record);
                Lookup::Settled
            }
            Ok(Some(record)) => record
                .gateway_correlation_id
                .map_or(Lookup::Missing, Lookup::Found),
            Ok(None) => Lookup::Missing,
            Err(e) => {
                warn!(operation = %ctx.operation_id, error = %e, "record lookup failed");
                Lookup::Missing
            }
        }
    }
}
