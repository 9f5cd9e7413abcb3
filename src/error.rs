use crate::domain::ledger::LedgerError;
use crate::domain::operation::{OperationId, OperationStatus};
use crate::domain::outcome::FailureKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfirmError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Operation {0} not found")]
    NotFound(OperationId),
    #[error("Operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("Push request rejected by gateway: {reason}")]
    GatewayRejected { reason: String },
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("Push request for {operation} may or may not have reached the payer: {reason}")]
    PushUnconfirmed {
        operation: OperationId,
        reason: String,
    },
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error(
        "Payment {operation} succeeded but completion failed after {attempts} attempt(s): {reason}"
    )]
    CompletionActionFailed {
        operation: OperationId,
        attempts: u32,
        reason: String,
    },
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl ConfirmError {
    /// The user-facing failure class, if this error is one the presentation layer renders.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ConfirmError::GatewayRejected { .. } => Some(FailureKind::GatewayRejected),
            ConfirmError::CompletionActionFailed { .. } => {
                Some(FailureKind::CompletionActionFailed)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ConfirmError {
    fn from(err: reqwest::Error) -> Self {
        ConfirmError::GatewayUnavailable(err.to_string())
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for ConfirmError {
    fn from(err: rocksdb::Error) -> Self {
        ConfirmError::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, ConfirmError>;
