use super::completion::CompletionDispatcher;
use super::orchestrator::ConfirmationOrchestrator;
use crate::domain::gateway::{PushMetadata, PushRequest};
use crate::domain::ledger::Amount;
use crate::domain::operation::{
    NewOperation, OperationId, OperationStatus, PayerReference, PendingOperation,
};
use crate::domain::outcome::Outcome;
use crate::domain::ports::{OperationStoreRef, PushGatewayRef};
use crate::error::{ConfirmError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The four mobile-money flows of the platform, from push request to completion.
///
/// `run` is `start` followed by `confirm`; the two halves are public so callers
/// can act on the record in between (show a "check your phone" prompt, wire a
/// webhook, offer a cancel button).
pub struct PaymentFlow {
    store: OperationStoreRef,
    push_gateway: PushGatewayRef,
    orchestrator: Arc<ConfirmationOrchestrator>,
    dispatcher: CompletionDispatcher,
    deadline: Duration,
}

impl PaymentFlow {
    pub fn new(
        store: OperationStoreRef,
        push_gateway: PushGatewayRef,
        orchestrator: Arc<ConfirmationOrchestrator>,
        dispatcher: CompletionDispatcher,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            push_gateway,
            orchestrator,
            dispatcher,
            deadline,
        }
    }

    pub fn orchestrator(&self) -> &ConfirmationOrchestrator {
        &self.orchestrator
    }

    /// Records the operation and sends the push request.
    ///
    /// A refused push fails the record and is returned as an error; there is
    /// nothing to confirm. When the gateway could not be reached the record is
    /// left open and [`ConfirmError::PushUnconfirmed`] carries its id, since the
    /// prompt may still have been delivered.
    pub async fn start(&self, request: NewOperation) -> Result<PendingOperation> {
        let operation = PendingOperation::create(request);
        self.store.create(operation.clone()).await?;
        let id = operation.id.clone();

        let push = PushRequest {
            payer_reference: operation.payer_reference.clone(),
            amount: operation.amount,
            metadata: PushMetadata {
                operation_id: id.clone(),
                kind: operation.kind,
                subject_id: operation.subject_id.clone(),
            },
        };
        let accepted = match self.push_gateway.initiate_push(push).await {
            Ok(accepted) => accepted,
            Err(ConfirmError::GatewayRejected { reason }) => {
                warn!(operation = %id, %reason, "push request rejected");
                self.store
                    .transition(&id, OperationStatus::Failed, Some(reason.clone()))
                    .await?;
                return Err(ConfirmError::GatewayRejected { reason });
            }
            Err(e) => {
                // The prompt may have gone out; the webhook or the deadline settles it.
                warn!(operation = %id, error = %e, "push request outcome unknown");
                self.store
                    .transition(&id, OperationStatus::GatewayRequestSent, None)
                    .await?;
                return Err(ConfirmError::PushUnconfirmed {
                    operation: id,
                    reason: e.to_string(),
                });
            }
        };

        let transition = match accepted.correlation_id {
            Some(correlation) => self.store.attach_correlation(&id, correlation).await?,
            None => {
                self.store
                    .transition(&id, OperationStatus::GatewayRequestSent, None)
                    .await?
            }
        };
        info!(operation = %id, kind = %operation.kind, "push request sent");
        Ok(transition.into_record())
    }

    pub async fn confirm(&self, operation_id: &OperationId) -> Result<Outcome> {
        self.orchestrator
            .confirm(operation_id, self.deadline, &self.dispatcher)
            .await
    }

    /// `start` then `confirm`. A push with an unknown fate is still confirmed.
    pub async fn run(&self, request: NewOperation) -> Result<Outcome> {
        let id = match self.start(request).await {
            Ok(operation) => operation.id,
            Err(ConfirmError::PushUnconfirmed { operation, .. }) => operation,
            Err(e) => return Err(e),
        };
        self.confirm(&id).await
    }

    /// Tops up the payer's wallet.
    pub async fn deposit(&self, payer: PayerReference, amount: Amount) -> Result<Outcome> {
        self.run(NewOperation::deposit(payer, amount)).await
    }

    /// Funds the wallet and buys `coin` with it at the current price.
    pub async fn buy(
        &self,
        payer: PayerReference,
        coin: impl Into<String>,
        amount: Amount,
    ) -> Result<Outcome> {
        self.run(NewOperation::buy(payer, coin, amount)).await
    }

    pub async fn pay_creation_fee(
        &self,
        payer: PayerReference,
        listing: impl Into<String>,
        amount: Amount,
    ) -> Result<Outcome> {
        self.run(NewOperation::creation_fee(payer, listing, amount))
            .await
    }

    pub async fn payout(
        &self,
        payee: PayerReference,
        withdrawal: impl Into<String>,
        amount: Amount,
    ) -> Result<Outcome> {
        self.run(NewOperation::payout(payee, withdrawal, amount)).await
    }
}
