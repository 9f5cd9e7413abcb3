use super::operation::{OperationStatus, PendingOperation};
use serde::Serialize;
use std::fmt;

/// The single terminal result of a confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Cancelled,
    Failed(String),
    TimedOut,
}

impl Outcome {
    /// Maps a terminal status (plus its stored detail) to an outcome. `None` for open states.
    pub fn from_status(status: OperationStatus, detail: Option<&str>) -> Option<Self> {
        match status {
            OperationStatus::Succeeded => Some(Outcome::Succeeded),
            OperationStatus::Cancelled => Some(Outcome::Cancelled),
            OperationStatus::Failed => Some(Outcome::Failed(
                detail.unwrap_or("payment failed at gateway").to_string(),
            )),
            OperationStatus::TimedOut => Some(Outcome::TimedOut),
            OperationStatus::Pending | OperationStatus::GatewayRequestSent => None,
        }
    }

    pub fn of(operation: &PendingOperation) -> Option<Self> {
        Self::from_status(operation.status, operation.error_detail.as_deref())
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Succeeded => None,
            Outcome::Cancelled => Some(FailureKind::UserCancelled),
            Outcome::Failed(_) => Some(FailureKind::GatewayFailed),
            Outcome::TimedOut => Some(FailureKind::TimedOut),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => f.write_str("succeeded"),
            Outcome::Cancelled => f.write_str("cancelled"),
            Outcome::Failed(_) => f.write_str("failed"),
            Outcome::TimedOut => f.write_str("timed_out"),
        }
    }
}

/// User-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The push request itself was refused; no confirmation was attempted.
    GatewayRejected,
    /// The payer declined or cancelled the prompt.
    UserCancelled,
    /// The gateway reported a terminal failure (insufficient funds, expiry, ...).
    GatewayFailed,
    /// Nothing terminal was observed before the deadline. The payment may still land.
    TimedOut,
    /// Money moved but the dependent state change could not be applied.
    CompletionActionFailed,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::GatewayRejected | FailureKind::UserCancelled | FailureKind::GatewayFailed
        )
    }

    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::GatewayRejected => {
                "The payment request could not be sent. Please try again."
            }
            FailureKind::UserCancelled => "The payment was cancelled. Please try again.",
            FailureKind::GatewayFailed => "The payment failed. Please try again.",
            FailureKind::TimedOut => {
                "We have not received confirmation yet. The payment may still complete; check back shortly."
            }
            FailureKind::CompletionActionFailed => {
                "Your payment was received but we could not finish processing it. Support has been notified."
            }
        }
    }
}
