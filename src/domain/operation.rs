use super::gateway::CorrelationId;
use super::ledger::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of a pending operation. Assigned once at creation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phone number or account handle the push request is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayerReference(String);

impl PayerReference {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the money is for. Selects the completion action applied on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deposit,
    #[serde(alias = "buy")]
    BuyViaGateway,
    #[serde(alias = "creation_fee")]
    CoinCreationFee,
    Payout,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Deposit => "deposit",
            OperationKind::BuyViaGateway => "buy_via_gateway",
            OperationKind::CoinCreationFee => "coin_creation_fee",
            OperationKind::Payout => "payout",
        };
        f.write_str(name)
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "deposit" => Ok(OperationKind::Deposit),
            "buy_via_gateway" | "buy" => Ok(OperationKind::BuyViaGateway),
            "coin_creation_fee" | "creation_fee" => Ok(OperationKind::CoinCreationFee),
            "payout" => Ok(OperationKind::Payout),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    GatewayRequestSent,
    Succeeded,
    Cancelled,
    Failed,
    TimedOut,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded
                | OperationStatus::Cancelled
                | OperationStatus::Failed
                | OperationStatus::TimedOut
        )
    }

    /// Whether a record in `self` may be moved to `next`.
    ///
    /// Terminal states accept nothing, which is what makes every status write a
    /// compare-and-set against "still open".
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (OperationStatus::Pending, OperationStatus::GatewayRequestSent) => true,
            (_, to) => to.is_terminal(),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::GatewayRequestSent => "gateway_request_sent",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::Failed => "failed",
            OperationStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Durable marker tracking whether the completion action for a succeeded payment ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMark {
    #[default]
    Unclaimed,
    Claimed,
    Applied,
    Abandoned,
}

impl CompletionMark {
    /// A claim may be taken when nobody holds it and it has not already been applied.
    pub fn is_claimable(self) -> bool {
        matches!(self, CompletionMark::Unclaimed | CompletionMark::Abandoned)
    }
}

/// Caller's request to collect money; becomes a `PendingOperation` once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub amount: Amount,
    pub payer_reference: PayerReference,
    pub subject_id: Option<String>,
}

impl NewOperation {
    pub fn deposit(payer: PayerReference, amount: Amount) -> Self {
        Self {
            kind: OperationKind::Deposit,
            amount,
            payer_reference: payer,
            subject_id: None,
        }
    }

    pub fn buy(payer: PayerReference, coin: impl Into<String>, amount: Amount) -> Self {
        Self {
            kind: OperationKind::BuyViaGateway,
            amount,
            payer_reference: payer,
            subject_id: Some(coin.into()),
        }
    }

    pub fn creation_fee(payer: PayerReference, listing: impl Into<String>, amount: Amount) -> Self {
        Self {
            kind: OperationKind::CoinCreationFee,
            amount,
            payer_reference: payer,
            subject_id: Some(listing.into()),
        }
    }

    pub fn payout(payee: PayerReference, withdrawal: impl Into<String>, amount: Amount) -> Self {
        Self {
            kind: OperationKind::Payout,
            amount,
            payer_reference: payee,
            subject_id: Some(withdrawal.into()),
        }
    }
}

/// A durable record of money being requested from a payer for a purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub amount: Amount,
    pub payer_reference: PayerReference,
    pub subject_id: Option<String>,
    pub status: OperationStatus,
    pub gateway_correlation_id: Option<CorrelationId>,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub completion: CompletionMark,
}

impl PendingOperation {
    pub fn create(request: NewOperation) -> Self {
        Self {
            id: OperationId::generate(),
            kind: request.kind,
            amount: request.amount,
            payer_reference: request.payer_reference,
            subject_id: request.subject_id,
            status: OperationStatus::Pending,
            gateway_correlation_id: None,
            error_detail: None,
            completion: CompletionMark::Unclaimed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the record to `next`, returning `false` (and leaving it untouched) if not allowed.
    pub fn transition(&mut self, next: OperationStatus, detail: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if detail.is_some() {
            self.error_detail = detail;
        }
        true
    }

    /// Records the gateway correlation id and marks the push as sent.
    ///
    /// A correlation id that is already present is kept. Late arrivals on a
    /// terminal record are ignored.
    pub fn attach_correlation(&mut self, correlation: CorrelationId) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self.gateway_correlation_id.is_none() {
            self.gateway_correlation_id = Some(correlation);
        }
        if self.status == OperationStatus::Pending {
            self.status = OperationStatus::GatewayRequestSent;
        }
        true
    }

    pub fn claim_completion(&mut self) -> bool {
        if self.status != OperationStatus::Succeeded || !self.completion.is_claimable() {
            return false;
        }
        self.completion = CompletionMark::Claimed;
        true
    }
}

/// Result of a compare-and-set status write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The write happened; carries the updated record.
    Applied(PendingOperation),
    /// The record was already in a state that does not accept the write; carries it unchanged.
    Rejected(PendingOperation),
}

impl Transition {
    pub fn record(&self) -> &PendingOperation {
        match self {
            Transition::Applied(op) | Transition::Rejected(op) => op,
        }
    }

    pub fn into_record(self) -> PendingOperation {
        match self {
            Transition::Applied(op) | Transition::Rejected(op) => op,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}
