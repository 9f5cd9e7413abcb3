use crate::domain::gateway::{
    CorrelationId, GatewayReport, GatewayState, PushAccepted, PushRequest,
};
use crate::domain::operation::{OperationId, OperationStatus, PayerReference};
use crate::domain::ports::{OperationStoreRef, PushGateway, StatusGateway};
use crate::error::{ConfirmError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One scripted answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Report(GatewayState),
    /// The query fails as if the gateway could not be reached.
    Unreachable,
}

impl FromStr for ScriptedReply {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "unreachable" => Ok(ScriptedReply::Unreachable),
            state => state.parse().map(ScriptedReply::Report),
        }
    }
}

/// How the simulated gateway behaves for one payer.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayScript {
    /// Answers to successive status queries; the last one repeats. Empty means
    /// the prompt stays unanswered.
    pub replies: Vec<ScriptedReply>,
    /// Delay before every status query returns.
    pub latency: Duration,
    /// Refuse the push request with this reason.
    pub reject: Option<String>,
    /// Accept the push but never hand out a correlation id.
    pub withhold_correlation: bool,
    /// Deliver the prompt but fail the push call as if the response was lost.
    pub lose_push_response: bool,
    /// Whether `cancel_push` is honoured.
    pub cancellable: bool,
}

impl Default for GatewayScript {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
            latency: Duration::ZERO,
            reject: None,
            withhold_correlation: false,
            lose_push_response: false,
            cancellable: true,
        }
    }
}

impl GatewayScript {
    pub fn replying(states: impl IntoIterator<Item = GatewayState>) -> Self {
        Self {
            replies: states.into_iter().map(ScriptedReply::Report).collect(),
            ..Self::default()
        }
    }

    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Parses a `|` separated reply list such as `awaiting_authorization|completed`.
    pub fn parse_replies(list: &str) -> std::result::Result<Vec<ScriptedReply>, String> {
        list.split('|')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ScriptedReply::from_str)
            .collect()
    }
}

#[derive(Debug)]
struct PushSession {
    script: GatewayScript,
    queries: usize,
    cancelled: bool,
}

impl PushSession {
    fn next_reply(&mut self) -> ScriptedReply {
        if self.cancelled {
            return ScriptedReply::Report(GatewayState::CancelledByPayer);
        }
        let reply = match self.script.replies.as_slice() {
            [] => ScriptedReply::Report(GatewayState::AwaitingAuthorization),
            replies => replies[self.queries.min(replies.len() - 1)].clone(),
        };
        self.queries += 1;
        reply
    }
}

/// Scriptable stand-in for a mobile-money gateway.
///
/// Behaviour is looked up by payer reference when a push is initiated; unscripted
/// payers get [`GatewayScript::default`]. Counters double as spies for tests.
#[derive(Debug, Default)]
pub struct SimulatedGateway {
    scripts: Mutex<HashMap<PayerReference, GatewayScript>>,
    sessions: Mutex<HashMap<CorrelationId, PushSession>>,
    pushes: AtomicUsize,
    queries: AtomicUsize,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, payer: PayerReference, script: GatewayScript) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(payer, script);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Status queries received so far, across all correlation ids.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn script_for(&self, payer: &PayerReference) -> GatewayScript {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(payer)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PushGateway for SimulatedGateway {
    async fn initiate_push(&self, request: PushRequest) -> Result<PushAccepted> {
        let script = self.script_for(&request.payer_reference);
        if let Some(reason) = &script.reject {
            info!(payer = %request.payer_reference, reason, "simulated push rejected");
            return Err(ConfirmError::GatewayRejected {
                reason: reason.clone(),
            });
        }

        let sequence = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
        let correlation = CorrelationId::new(format!("SIM-{sequence:06}"));
        let withhold = script.withhold_correlation;
        let lose_response = script.lose_push_response;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                correlation.clone(),
                PushSession {
                    script,
                    queries: 0,
                    cancelled: false,
                },
            );
        debug!(
            operation = %request.metadata.operation_id,
            %correlation,
            "simulated push accepted"
        );
        if lose_response {
            return Err(ConfirmError::GatewayUnavailable(
                "push response lost in transit".to_string(),
            ));
        }
        Ok(PushAccepted {
            correlation_id: (!withhold).then_some(correlation),
        })
    }

    async fn cancel_push(&self, correlation: &CorrelationId) -> Result<bool> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(correlation) {
            Some(session) if session.script.cancellable => {
                session.cancelled = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ConfirmError::GatewayUnavailable(format!(
                "unknown correlation id {correlation}"
            ))),
        }
    }
}

#[async_trait]
impl StatusGateway for SimulatedGateway {
    async fn query(&self, correlation: &CorrelationId) -> Result<GatewayReport> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let (reply, latency) = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let session = sessions.get_mut(correlation).ok_or_else(|| {
                ConfirmError::GatewayUnavailable(format!("unknown correlation id {correlation}"))
            })?;
            (session.next_reply(), session.script.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match reply {
            ScriptedReply::Report(state) => Ok(GatewayReport::new(state)),
            ScriptedReply::Unreachable => Err(ConfirmError::GatewayUnavailable(
                "simulated gateway unreachable".to_string(),
            )),
        }
    }
}

/// Plays the backend's webhook handler: after `after`, writes `status` to the record.
///
/// The write is the same compare-and-set any other writer uses, so a late webhook
/// on a terminal record changes nothing.
pub fn schedule_webhook(
    store: OperationStoreRef,
    operation: OperationId,
    status: OperationStatus,
    detail: Option<String>,
    after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        match store.transition(&operation, status, detail).await {
            Ok(transition) if transition.applied() => {
                info!(%operation, %status, "webhook applied");
            }
            Ok(transition) => {
                debug!(
                    %operation,
                    %status,
                    current = %transition.record().status,
                    "webhook ignored, record already settled"
                );
            }
            Err(e) => warn!(%operation, error = %e, "webhook write failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway::PushMetadata;
    use crate::domain::ledger::Amount;
    use crate::domain::operation::OperationKind;
    use rust_decimal_macros::dec;

    fn request(payer: &str) -> PushRequest {
        PushRequest {
            payer_reference: PayerReference::new(payer),
            amount: Amount::new(dec!(10)).unwrap(),
            metadata: PushMetadata {
                operation_id: OperationId::from("op-sim"),
                kind: OperationKind::Deposit,
                subject_id: None,
            },
        }
    }

    #[tokio::test]
    async fn test_replies_advance_and_last_repeats() {
        let gateway = SimulatedGateway::new();
        gateway.script(
            PayerReference::new("254711000001"),
            GatewayScript::replying([GatewayState::Processing, GatewayState::Completed]),
        );
        let accepted = gateway.initiate_push(request("254711000001")).await.unwrap();
        let correlation = accepted.correlation_id.unwrap();

        let mut states = Vec::new();
        for _ in 0..3 {
            states.push(gateway.query(&correlation).await.unwrap().state);
        }
        assert_eq!(
            states,
            vec![
                GatewayState::Processing,
                GatewayState::Completed,
                GatewayState::Completed
            ]
        );
        assert_eq!(gateway.query_count(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_payer_stays_awaiting() {
        let gateway = SimulatedGateway::new();
        let correlation = gateway
            .initiate_push(request("254711000002"))
            .await
            .unwrap()
            .correlation_id
            .unwrap();
        let report = gateway.query(&correlation).await.unwrap();
        assert_eq!(report.state, GatewayState::AwaitingAuthorization);
    }

    #[tokio::test]
    async fn test_rejected_push_opens_no_session() {
        let gateway = SimulatedGateway::new();
        gateway.script(
            PayerReference::new("254711000003"),
            GatewayScript::rejecting("invalid msisdn"),
        );
        let err = gateway
            .initiate_push(request("254711000003"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConfirmError::GatewayRejected { reason } if reason == "invalid msisdn"
        ));
        assert_eq!(gateway.push_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_turns_session_into_cancelled() {
        let gateway = SimulatedGateway::new();
        let correlation = gateway
            .initiate_push(request("254711000004"))
            .await
            .unwrap()
            .correlation_id
            .unwrap();
        assert!(gateway.cancel_push(&correlation).await.unwrap());
        assert_eq!(
            gateway.query(&correlation).await.unwrap().state,
            GatewayState::CancelledByPayer
        );
    }

    #[tokio::test]
    async fn test_withheld_correlation() {
        let gateway = SimulatedGateway::new();
        gateway.script(
            PayerReference::new("254711000005"),
            GatewayScript {
                withhold_correlation: true,
                ..GatewayScript::default()
            },
        );
        let accepted = gateway.initiate_push(request("254711000005")).await.unwrap();
        assert!(accepted.correlation_id.is_none());
        assert_eq!(gateway.push_count(), 1);
    }

    #[test]
    fn test_parse_replies() {
        let replies = GatewayScript::parse_replies("awaiting_authorization| unreachable |completed")
            .unwrap();
        assert_eq!(
            replies,
            vec![
                ScriptedReply::Report(GatewayState::AwaitingAuthorization),
                ScriptedReply::Unreachable,
                ScriptedReply::Report(GatewayState::Completed),
            ]
        );
        assert!(GatewayScript::parse_replies("").unwrap().is_empty());
    }
}
