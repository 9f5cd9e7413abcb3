use super::change_feed::BroadcastChangeFeed;
use crate::domain::gateway::CorrelationId;
use crate::domain::ledger::{
    CoinListing, LedgerBook, LedgerEntry, LedgerError, LedgerReceipt, Wallet, Withdrawal,
};
use crate::domain::operation::{
    CompletionMark, OperationId, OperationStatus, PayerReference, PendingOperation, Transition,
};
use crate::domain::ports::{LedgerStore, OperationStore, PriceOracle};
use crate::error::{ConfirmError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for pending operations.
///
/// Status writes happen under the write lock, which makes `transition` a true
/// compare-and-set. Every applied write is published on the attached change feed.
#[derive(Clone)]
pub struct InMemoryOperationStore {
    operations: Arc<RwLock<HashMap<OperationId, PendingOperation>>>,
    feed: BroadcastChangeFeed,
}

impl InMemoryOperationStore {
    pub fn new(feed: BroadcastChangeFeed) -> Self {
        Self {
            operations: Arc::default(),
            feed,
        }
    }

    pub fn feed(&self) -> &BroadcastChangeFeed {
        &self.feed
    }

    async fn update<F>(&self, id: &OperationId, mutate: F) -> Result<Transition>
    where
        F: FnOnce(&mut PendingOperation) -> bool + Send,
    {
        let mut operations = self.operations.write().await;
        let operation = operations
            .get_mut(id)
            .ok_or_else(|| ConfirmError::NotFound(id.clone()))?;
        let previous = operation.status;
        if !mutate(operation) {
            return Ok(Transition::Rejected(operation.clone()));
        }
        if operation.status != previous {
            self.feed.publish(operation);
        }
        Ok(Transition::Applied(operation.clone()))
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create(&self, operation: PendingOperation) -> Result<()> {
        let mut operations = self.operations.write().await;
        if operations.contains_key(&operation.id) {
            return Err(ConfirmError::ValidationError(format!(
                "operation {} already exists",
                operation.id
            )));
        }
        operations.insert(operation.id.clone(), operation);
        Ok(())
    }

    async fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>> {
        let operations = self.operations.read().await;
        Ok(operations.get(id).cloned())
    }

    async fn attach_correlation(
        &self,
        id: &OperationId,
        correlation: CorrelationId,
    ) -> Result<Transition> {
        self.update(id, |op| op.attach_correlation(correlation)).await
    }

    async fn transition(
        &self,
        id: &OperationId,
        status: OperationStatus,
        detail: Option<String>,
    ) -> Result<Transition> {
        self.update(id, |op| op.transition(status, detail)).await
    }

    async fn claim_completion(&self, id: &OperationId) -> Result<bool> {
        let transition = self.update(id, PendingOperation::claim_completion).await?;
        Ok(transition.applied())
    }

    async fn settle_completion(&self, id: &OperationId, mark: CompletionMark) -> Result<()> {
        let mut operations = self.operations.write().await;
        let operation = operations
            .get_mut(id)
            .ok_or_else(|| ConfirmError::NotFound(id.clone()))?;
        operation.completion = mark;
        Ok(())
    }
}

/// In-memory wallets, listings and withdrawals with per-operation "applied" markers.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    book: Arc<RwLock<LedgerBook>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn apply(
        &self,
        operation: &OperationId,
        entry: LedgerEntry,
    ) -> std::result::Result<LedgerReceipt, LedgerError> {
        let mut book = self.book.write().await;
        book.apply(operation, &entry)
    }

    async fn wallet(&self, owner: &PayerReference) -> Result<Option<Wallet>> {
        let book = self.book.read().await;
        Ok(book.wallets.get(owner).cloned())
    }

    async fn register_listing(&self, listing: CoinListing) -> Result<()> {
        let mut book = self.book.write().await;
        book.listings.insert(listing.id.clone(), listing);
        Ok(())
    }

    async fn listing(&self, id: &str) -> Result<Option<CoinListing>> {
        let book = self.book.read().await;
        Ok(book.listings.get(id).cloned())
    }

    async fn register_withdrawal(&self, withdrawal: Withdrawal) -> Result<()> {
        let mut book = self.book.write().await;
        book.withdrawals.insert(withdrawal.id.clone(), withdrawal);
        Ok(())
    }

    async fn withdrawal(&self, id: &str) -> Result<Option<Withdrawal>> {
        let book = self.book.read().await;
        Ok(book.withdrawals.get(id).cloned())
    }
}

/// Price oracle serving prices set explicitly, e.g. from a market snapshot.
#[derive(Default, Clone)]
pub struct FixedPriceOracle {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl FixedPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, coin: impl Into<String>, price: Decimal) {
        self.prices.write().await.insert(coin.into(), price);
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn current_price(&self, coin: &str) -> std::result::Result<Decimal, LedgerError> {
        let prices = self.prices.read().await;
        prices
            .get(coin)
            .copied()
            .ok_or_else(|| LedgerError::PriceUnavailable(coin.to_string()))
    }
}
