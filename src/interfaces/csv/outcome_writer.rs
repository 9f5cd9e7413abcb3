use crate::domain::operation::{OperationKind, PayerReference};
use crate::domain::outcome::Outcome;
use crate::error::{ConfirmError, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

/// One line of the report: how a scenario row ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub payer: PayerReference,
    pub kind: OperationKind,
    pub outcome: String,
    pub detail: String,
    /// Wallet balance of the payer once every row has finished.
    pub balance: Decimal,
}

impl OutcomeRecord {
    pub fn new(
        payer: PayerReference,
        kind: OperationKind,
        result: &Result<Outcome>,
        balance: Decimal,
    ) -> Self {
        let (outcome, detail) = match result {
            Ok(Outcome::Failed(reason)) => ("failed".to_string(), reason.clone()),
            Ok(outcome) => (outcome.to_string(), String::new()),
            Err(ConfirmError::GatewayRejected { reason }) => {
                ("rejected".to_string(), reason.clone())
            }
            Err(e @ ConfirmError::CompletionActionFailed { .. }) => {
                ("completion_failed".to_string(), e.to_string())
            }
            Err(e) => ("error".to_string(), e.to_string()),
        };
        Self {
            payer,
            kind,
            outcome,
            detail,
            balance: balance.normalize(),
        }
    }
}

/// Writes outcome records as CSV, in the order given.
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_outcomes(
        &mut self,
        records: impl IntoIterator<Item = OutcomeRecord>,
    ) -> Result<()> {
        for record in records {
            self.writer.serialize(record)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationId;
    use rust_decimal_macros::dec;

    fn render(records: Vec<OutcomeRecord>) -> String {
        let mut buffer = Vec::new();
        OutcomeWriter::new(&mut buffer).write_outcomes(records).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_writer_renders_each_result_class() {
        let payer = PayerReference::new("254744000001");
        let rows = vec![
            OutcomeRecord::new(
                payer.clone(),
                OperationKind::Deposit,
                &Ok(Outcome::Succeeded),
                dec!(150.00),
            ),
            OutcomeRecord::new(
                payer.clone(),
                OperationKind::Deposit,
                &Ok(Outcome::Failed("insufficient funds".into())),
                dec!(150),
            ),
            OutcomeRecord::new(
                payer.clone(),
                OperationKind::Payout,
                &Err(ConfirmError::GatewayRejected {
                    reason: "invalid msisdn".into(),
                }),
                dec!(150),
            ),
            OutcomeRecord::new(
                payer,
                OperationKind::CoinCreationFee,
                &Err(ConfirmError::CompletionActionFailed {
                    operation: OperationId::from("op-9"),
                    attempts: 7,
                    reason: "listing coin-1 not found".into(),
                }),
                dec!(150),
            ),
        ];

        let out = render(rows);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "payer,kind,outcome,detail,balance");
        assert_eq!(lines[1], "254744000001,deposit,succeeded,,150");
        assert_eq!(lines[2], "254744000001,deposit,failed,insufficient funds,150");
        assert_eq!(lines[3], "254744000001,payout,rejected,invalid msisdn,150");
        assert!(lines[4].starts_with("254744000001,coin_creation_fee,completion_failed,"));
    }
}
