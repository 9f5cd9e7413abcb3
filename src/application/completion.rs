use crate::config::ConfirmConfig;
use crate::domain::ledger::{LedgerEntry, LedgerError, LedgerReceipt};
use crate::domain::operation::{OperationKind, PendingOperation};
use crate::domain::ports::{LedgerStoreRef, PriceOracleRef};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    /// May succeed if tried again later.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Transient(_))
    }
}

impl From<LedgerError> for CompletionError {
    fn from(err: LedgerError) -> Self {
        if err.is_transient() {
            CompletionError::Transient(err.to_string())
        } else {
            CompletionError::Permanent(err.to_string())
        }
    }
}

/// The dependent state change applied once a payment succeeds.
///
/// Implementations must be idempotent per operation: the orchestrator calls them
/// at most once per claim, but a crashed claim may be retried by hand.
#[async_trait]
pub trait CompletionAction: Send + Sync {
    async fn complete(&self, operation: &PendingOperation) -> Result<(), CompletionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub spacing: Duration,
}

impl From<&ConfirmConfig> for RetryPolicy {
    fn from(config: &ConfirmConfig) -> Self {
        Self {
            retries: config.completion_retries,
            spacing: config.completion_retry_spacing(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionFailure {
    pub attempts: u32,
    pub error: CompletionError,
}

/// Runs `attempt` until it succeeds, fails permanently, or the retries run out.
/// Returns the number of attempts made.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<u32, CompletionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CompletionError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(()) => return Ok(attempts),
            Err(error) if error.is_transient() && attempts <= policy.retries => {
                warn!(attempts, error = %error, "completion attempt failed, retrying");
                tokio::time::sleep(policy.spacing).await;
            }
            Err(error) => return Err(CompletionFailure { attempts, error }),
        }
    }
}

/// Applies the ledger entries each kind of operation calls for.
///
/// | kind               | entries                                   |
/// |--------------------|-------------------------------------------|
/// | `deposit`          | credit the payer's wallet                 |
/// | `buy_via_gateway`  | credit, then buy the coin at today's price |
/// | `coin_creation_fee`| mark the listing's fee paid               |
/// | `payout`           | mark the withdrawal completed             |
#[derive(Clone)]
pub struct CompletionDispatcher {
    ledger: LedgerStoreRef,
    prices: PriceOracleRef,
}

impl CompletionDispatcher {
    pub fn new(ledger: LedgerStoreRef, prices: PriceOracleRef) -> Self {
        Self { ledger, prices }
    }

    async fn entries_for(
        &self,
        operation: &PendingOperation,
    ) -> Result<Vec<LedgerEntry>, CompletionError> {
        let wallet = operation.payer_reference.clone();
        let amount = operation.amount;
        let subject = || {
            operation
                .subject_id
                .clone()
                .ok_or(CompletionError::from(LedgerError::MissingSubject))
        };
        let entries = match operation.kind {
            OperationKind::Deposit => vec![LedgerEntry::Credit { wallet, amount }],
            OperationKind::BuyViaGateway => {
                let coin = subject()?;
                let price = self.prices.current_price(&coin).await?;
                vec![
                    LedgerEntry::Credit {
                        wallet: wallet.clone(),
                        amount,
                    },
                    LedgerEntry::Purchase {
                        wallet,
                        coin,
                        amount,
                        price,
                    },
                ]
            }
            OperationKind::CoinCreationFee => vec![LedgerEntry::FeePaid { listing: subject()? }],
            OperationKind::Payout => vec![LedgerEntry::WithdrawalCompleted {
                withdrawal: subject()?,
            }],
        };
        Ok(entries)
    }
}

#[async_trait]
impl CompletionAction for CompletionDispatcher {
    async fn complete(&self, operation: &PendingOperation) -> Result<(), CompletionError> {
        for entry in self.entries_for(operation).await? {
            let step = entry.step();
            match self.ledger.apply(&operation.id, entry).await? {
                LedgerReceipt::Applied => {
                    debug!(operation = %operation.id, step, "ledger entry applied")
                }
                LedgerReceipt::AlreadyApplied => {
                    debug!(operation = %operation.id, step, "ledger entry already applied")
                }
            }
        }
        Ok(())
    }
}
