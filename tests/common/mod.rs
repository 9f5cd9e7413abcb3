#![allow(dead_code)]

use async_trait::async_trait;
use momo_confirm::application::completion::{
    CompletionAction, CompletionDispatcher, CompletionError,
};
use momo_confirm::application::flow::PaymentFlow;
use momo_confirm::application::orchestrator::ConfirmationOrchestrator;
use momo_confirm::config::ConfirmConfig;
use momo_confirm::domain::ledger::Amount;
use momo_confirm::domain::operation::{
    NewOperation, OperationId, OperationStatus, PayerReference, PendingOperation,
};
use momo_confirm::domain::outcome::Outcome;
use momo_confirm::domain::ports::OperationStore;
use momo_confirm::error::Result;
use momo_confirm::infrastructure::change_feed::BroadcastChangeFeed;
use momo_confirm::infrastructure::in_memory::{
    FixedPriceOracle, InMemoryLedger, InMemoryOperationStore,
};
use momo_confirm::infrastructure::simulated_gateway::{
    GatewayScript, SimulatedGateway, schedule_webhook,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Everything a confirmation needs, wired against in-memory stores and the
/// scripted gateway.
pub struct Harness {
    pub config: ConfirmConfig,
    pub feed: BroadcastChangeFeed,
    pub store: Arc<InMemoryOperationStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub prices: Arc<FixedPriceOracle>,
    pub gateway: Arc<SimulatedGateway>,
    pub orchestrator: Arc<ConfirmationOrchestrator>,
    pub flow: PaymentFlow,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ConfirmConfig::default())
    }

    pub fn with_config(config: ConfirmConfig) -> Self {
        let feed = BroadcastChangeFeed::new(config.feed_capacity);
        let store = Arc::new(InMemoryOperationStore::new(feed.clone()));
        let ledger = Arc::new(InMemoryLedger::new());
        let prices = Arc::new(FixedPriceOracle::new());
        let gateway = Arc::new(SimulatedGateway::new());
        let orchestrator = Arc::new(
            ConfirmationOrchestrator::new(
                store.clone(),
                Arc::new(feed.clone()),
                gateway.clone(),
                &config,
            )
            .with_push_gateway(gateway.clone()),
        );
        let flow = PaymentFlow::new(
            store.clone(),
            gateway.clone(),
            orchestrator.clone(),
            CompletionDispatcher::new(ledger.clone(), prices.clone()),
            config.deadline(),
        );
        Self {
            config,
            feed,
            store,
            ledger,
            prices,
            gateway,
            orchestrator,
            flow,
        }
    }

    pub fn script(&self, payer: &str, script: GatewayScript) {
        self.gateway.script(PayerReference::new(payer), script);
    }

    /// Creates a deposit and sends its push through the scripted gateway.
    pub async fn start_deposit(&self, payer: &str, amount: Decimal) -> PendingOperation {
        self.flow
            .start(NewOperation::deposit(
                PayerReference::new(payer),
                Amount::new(amount).unwrap(),
            ))
            .await
            .unwrap()
    }

    pub async fn confirm(
        &self,
        id: &OperationId,
        action: &dyn CompletionAction,
    ) -> Result<Outcome> {
        self.orchestrator
            .confirm(id, self.config.deadline(), action)
            .await
    }

    pub async fn record(&self, id: &OperationId) -> PendingOperation {
        self.store.get(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, id: &OperationId) -> OperationStatus {
        self.record(id).await.status
    }

    /// Simulates the backend's webhook handler writing `status` after `after`.
    pub fn webhook(
        &self,
        id: &OperationId,
        status: OperationStatus,
        after: Duration,
    ) -> JoinHandle<()> {
        schedule_webhook(self.store.clone(), id.clone(), status, None, after)
    }
}

/// Completion action spy: counts invocations and fails the first `failures` of them.
pub struct CountingAction {
    calls: AtomicU32,
    failures: u32,
    permanent: bool,
}

impl CountingAction {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            permanent: false,
        }
    }

    pub fn failing_permanently_first(failures: u32) -> Self {
        Self {
            permanent: true,
            ..Self::failing_first(failures)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionAction for CountingAction {
    async fn complete(
        &self,
        _operation: &PendingOperation,
    ) -> std::result::Result<(), CompletionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > self.failures {
            return Ok(());
        }
        if self.permanent {
            Err(CompletionError::Permanent("subject is gone".into()))
        } else {
            Err(CompletionError::Transient("balance not visible yet".into()))
        }
    }
}
