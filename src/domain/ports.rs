use super::feed::Subscription;
use super::gateway::{CorrelationId, GatewayReport, PushAccepted, PushRequest};
use super::ledger::{CoinListing, LedgerEntry, LedgerError, LedgerReceipt, Wallet, Withdrawal};
use super::operation::{
    CompletionMark, OperationId, OperationStatus, PayerReference, PendingOperation, Transition,
};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Durable storage of pending operations.
///
/// Every status write goes through [`OperationStore::transition`], which must be an
/// atomic compare-and-set: it applies only while the record is not terminal.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, operation: PendingOperation) -> Result<()>;
    async fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>>;
    async fn attach_correlation(
        &self,
        id: &OperationId,
        correlation: CorrelationId,
    ) -> Result<Transition>;
    async fn transition(
        &self,
        id: &OperationId,
        status: OperationStatus,
        detail: Option<String>,
    ) -> Result<Transition>;
    /// Takes the right to run the completion action. `true` for exactly one caller.
    async fn claim_completion(&self, id: &OperationId) -> Result<bool>;
    async fn settle_completion(&self, id: &OperationId, mark: CompletionMark) -> Result<()>;
}

/// Push channel: notifications whenever a record's status changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, id: &OperationId) -> Result<Subscription>;
}

/// Pull channel: the gateway's synchronous status query. Must be side-effect free.
#[async_trait]
pub trait StatusGateway: Send + Sync {
    async fn query(&self, correlation: &CorrelationId) -> Result<GatewayReport>;
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Sends the payment prompt to the payer. A refusal is `ConfirmError::GatewayRejected`.
    async fn initiate_push(&self, request: PushRequest) -> Result<PushAccepted>;
    /// Asks the gateway to withdraw a prompt. `Ok(true)` only if cancellation is confirmed.
    async fn cancel_push(&self, correlation: &CorrelationId) -> Result<bool>;
}

/// Wallets, listings and withdrawals touched by completion actions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Applies `entry` on behalf of `operation` at most once per (operation, entry step).
    async fn apply(
        &self,
        operation: &OperationId,
        entry: LedgerEntry,
    ) -> std::result::Result<LedgerReceipt, LedgerError>;
    async fn wallet(&self, owner: &PayerReference) -> Result<Option<Wallet>>;
    async fn register_listing(&self, listing: CoinListing) -> Result<()>;
    async fn listing(&self, id: &str) -> Result<Option<CoinListing>>;
    async fn register_withdrawal(&self, withdrawal: Withdrawal) -> Result<()>;
    async fn withdrawal(&self, id: &str) -> Result<Option<Withdrawal>>;
}

/// Source of the current effective coin price. The pricing formula lives elsewhere.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn current_price(&self, coin: &str) -> std::result::Result<Decimal, LedgerError>;
}

pub type OperationStoreRef = Arc<dyn OperationStore>;
pub type ChangeFeedRef = Arc<dyn ChangeFeed>;
pub type StatusGatewayRef = Arc<dyn StatusGateway>;
pub type PushGatewayRef = Arc<dyn PushGateway>;
pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type PriceOracleRef = Arc<dyn PriceOracle>;
