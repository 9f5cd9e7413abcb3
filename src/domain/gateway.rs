use super::ledger::Amount;
use super::operation::{OperationId, OperationKind, PayerReference};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the payment gateway assigns once it accepts a push request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata attached to a push request so webhooks can be matched back to the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMetadata {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub subject_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub payer_reference: PayerReference,
    pub amount: Amount,
    pub metadata: PushMetadata,
}

/// The gateway's acknowledgement of a push request.
///
/// Some gateways only hand out the correlation id later (through the webhook),
/// hence the `Option`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAccepted {
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// Gateway-native payment states, as reported by a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    Queued,
    AwaitingAuthorization,
    Processing,
    Completed,
    CancelledByPayer,
    Declined,
    InsufficientFunds,
    Failed,
    Expired,
    #[serde(other)]
    Unknown,
}

impl std::str::FromStr for GatewayState {
    type Err = String;

    /// Strict parse for names written by hand: unlike the wire format, a name
    /// that matches no state is an error rather than `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let state = serde_json::from_value(serde_json::Value::String(name.to_string()))
            .map_err(|e| format!("invalid gateway state '{name}': {e}"))?;
        match state {
            GatewayState::Unknown if name != "unknown" => {
                Err(format!("unknown gateway state '{name}'"))
            }
            state => Ok(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayReport {
    pub state: GatewayState,
    #[serde(default)]
    pub detail: Option<String>,
}

impl GatewayReport {
    pub fn new(state: GatewayState) -> Self {
        Self { state, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_states_deserialize_as_unknown() {
        let report: GatewayReport =
            serde_json::from_str(r#"{"state":"reversal_in_progress"}"#).unwrap();
        assert_eq!(report.state, GatewayState::Unknown);
        assert!(report.detail.is_none());
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!(
            "awaiting_authorization".parse::<GatewayState>(),
            Ok(GatewayState::AwaitingAuthorization)
        );
        assert_eq!("completed".parse::<GatewayState>(), Ok(GatewayState::Completed));
        assert_eq!("unknown".parse::<GatewayState>(), Ok(GatewayState::Unknown));
        assert!("complted".parse::<GatewayState>().is_err());
    }
}
