use crate::domain::ledger::Amount;
use crate::domain::operation::{NewOperation, OperationKind, OperationStatus, PayerReference};
use crate::error::{ConfirmError, Result};
use crate::infrastructure::simulated_gateway::GatewayScript;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

/// One payment to run, plus how the simulated gateway and webhook should behave.
///
/// Only `kind`, `payer` and `amount` are required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScenarioRow {
    pub kind: OperationKind,
    pub payer: PayerReference,
    pub amount: Amount,
    /// Coin, listing or withdrawal id, depending on `kind`.
    #[serde(default)]
    pub subject: Option<String>,
    /// Coin price for `buy_via_gateway` rows.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// `|` separated gateway states answered to successive status queries.
    #[serde(default)]
    pub responses: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Refuse the push request with this reason.
    #[serde(default)]
    pub reject: Option<String>,
    #[serde(default)]
    pub withhold_correlation: Option<bool>,
    /// The prompt goes out but the push call itself fails.
    #[serde(default)]
    pub lose_push_response: Option<bool>,
    /// Status the webhook writes, `webhook_after_ms` after the push went out.
    #[serde(default)]
    pub webhook: Option<OperationStatus>,
    #[serde(default)]
    pub webhook_after_ms: Option<u64>,
    /// Ask for a cancel this long after the push went out.
    #[serde(default)]
    pub cancel_after_ms: Option<u64>,
}

impl ScenarioRow {
    pub fn request(&self) -> Result<NewOperation> {
        let payer = self.payer.clone();
        let subject = || {
            self.subject.clone().ok_or_else(|| {
                ConfirmError::ValidationError(format!("{} rows need a subject", self.kind))
            })
        };
        Ok(match self.kind {
            OperationKind::Deposit => NewOperation::deposit(payer, self.amount),
            OperationKind::BuyViaGateway => NewOperation::buy(payer, subject()?, self.amount),
            OperationKind::CoinCreationFee => {
                NewOperation::creation_fee(payer, subject()?, self.amount)
            }
            OperationKind::Payout => NewOperation::payout(payer, subject()?, self.amount),
        })
    }

    pub fn script(&self) -> Result<GatewayScript> {
        let replies = match &self.responses {
            Some(list) => {
                GatewayScript::parse_replies(list).map_err(ConfirmError::ValidationError)?
            }
            None => Vec::new(),
        };
        Ok(GatewayScript {
            replies,
            latency: Duration::from_millis(self.latency_ms.unwrap_or(0)),
            reject: self.reject.clone(),
            withhold_correlation: self.withhold_correlation.unwrap_or(false),
            lose_push_response: self.lose_push_response.unwrap_or(false),
            ..GatewayScript::default()
        })
    }

    /// The webhook to simulate, if the row asks for one.
    pub fn webhook(&self) -> Option<(OperationStatus, Duration)> {
        self.webhook
            .map(|status| (status, Duration::from_millis(self.webhook_after_ms.unwrap_or(0))))
    }
}

/// Reads scenario rows from a CSV source.
///
/// Whitespace is trimmed and trailing optional columns may be left out.
pub struct ScenarioReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ScenarioReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes rows; a malformed row yields an error and reading goes on.
    pub fn rows(self) -> impl Iterator<Item = Result<ScenarioRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(ConfirmError::from))
    }
}
