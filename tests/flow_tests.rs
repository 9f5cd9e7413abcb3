mod common;

use common::{CountingAction, Harness};
use momo_confirm::domain::gateway::GatewayState::{AwaitingAuthorization, Completed};
use momo_confirm::domain::ledger::{
    Amount, Balance, CoinListing, ListingStatus, Withdrawal, WithdrawalStatus,
};
use momo_confirm::domain::operation::{NewOperation, OperationStatus, PayerReference};
use momo_confirm::domain::outcome::{FailureKind, Outcome};
use momo_confirm::domain::ports::LedgerStore;
use momo_confirm::error::ConfirmError;
use momo_confirm::infrastructure::simulated_gateway::GatewayScript;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

fn amount(value: Decimal) -> Amount {
    Amount::new(value).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_deposit_credits_wallet() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200001");
    h.script(
        payer.as_str(),
        GatewayScript::replying([AwaitingAuthorization, Completed]),
    );

    let outcome = h.flow.deposit(payer.clone(), amount(dec!(250))).await.unwrap();

    assert_eq!(outcome, Outcome::Succeeded);
    let wallet = h.ledger.wallet(&payer).await.unwrap().unwrap();
    assert_eq!(wallet.balance, Balance::new(dec!(250)));
}

#[tokio::test(start_paused = true)]
async fn test_buy_funds_and_purchases_at_current_price() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200002");
    h.prices.set_price("SAFARI", dec!(0.25)).await;
    h.script(payer.as_str(), GatewayScript::replying([Completed]));

    let outcome = h
        .flow
        .buy(payer.clone(), "SAFARI", amount(dec!(50)))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Succeeded);
    let wallet = h.ledger.wallet(&payer).await.unwrap().unwrap();
    assert_eq!(wallet.holding("SAFARI"), dec!(200));
    assert_eq!(wallet.balance, Balance::new(dec!(0)));
}

#[tokio::test(start_paused = true)]
async fn test_creation_fee_moves_listing_to_review() {
    let h = Harness::new();
    let creator = PayerReference::new("254711200003");
    h.ledger
        .register_listing(CoinListing::new("coin-77", creator.clone()))
        .await
        .unwrap();
    h.script(creator.as_str(), GatewayScript::replying([Completed]));

    let outcome = h
        .flow
        .pay_creation_fee(creator, "coin-77", amount(dec!(1000)))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Succeeded);
    let listing = h.ledger.listing("coin-77").await.unwrap().unwrap();
    assert!(listing.fee_paid);
    assert_eq!(listing.status, ListingStatus::PendingApproval);
}

#[tokio::test(start_paused = true)]
async fn test_payout_completes_withdrawal() {
    let h = Harness::new();
    let payee = PayerReference::new("254711200004");
    h.ledger
        .register_withdrawal(Withdrawal::new("wd-5", payee.clone(), amount(dec!(75))))
        .await
        .unwrap();
    h.script(payee.as_str(), GatewayScript::replying([Completed]));

    let outcome = h
        .flow
        .payout(payee, "wd-5", amount(dec!(75)))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Succeeded);
    let withdrawal = h.ledger.withdrawal("wd-5").await.unwrap().unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_push_fails_without_confirming() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200005");
    h.script(payer.as_str(), GatewayScript::rejecting("subscriber not registered"));

    let err = h
        .flow
        .start(NewOperation::deposit(payer.clone(), amount(dec!(20))))
        .await
        .unwrap_err();

    assert!(matches!(
        &err,
        ConfirmError::GatewayRejected { reason } if reason == "subscriber not registered"
    ));
    assert_eq!(err.failure_kind(), Some(FailureKind::GatewayRejected));
    assert_eq!(h.gateway.query_count(), 0);
    assert!(h.ledger.wallet(&payer).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_start_attaches_correlation() {
    let h = Harness::new();
    let op = h.start_deposit("254711200007", dec!(5)).await;
    assert_eq!(op.status, OperationStatus::GatewayRequestSent);
    assert!(op.gateway_correlation_id.is_some());
    assert_eq!(h.gateway.push_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_deposit_leaves_wallet_untouched() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200008");

    let outcome = h.flow.deposit(payer.clone(), amount(dec!(10))).await.unwrap();

    assert_eq!(outcome, Outcome::TimedOut);
    assert_eq!(outcome.failure_kind(), Some(FailureKind::TimedOut));
    assert!(h.ledger.wallet(&payer).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_buy_without_price_reports_completion_failure() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200009");
    h.script(payer.as_str(), GatewayScript::replying([Completed]));

    let err = h
        .flow
        .buy(payer.clone(), "UNPRICED", amount(dec!(10)))
        .await
        .unwrap_err();

    // One attempt plus six retries, all waiting on a price.
    assert!(matches!(
        err,
        ConfirmError::CompletionActionFailed { attempts: 7, .. }
    ));
    // The money arrived even though the purchase did not happen.
    let wallet = h.ledger.wallet(&payer).await.unwrap().unwrap();
    assert_eq!(wallet.balance, Balance::new(dec!(10)));
}

#[tokio::test(start_paused = true)]
async fn test_purchase_overflow_fails_completion_without_panicking() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200010");
    h.prices.set_price("TINY", dec!(0.0001)).await;
    h.script(payer.as_str(), GatewayScript::replying([Completed]));
    let huge = Decimal::from_i128_with_scale(10_i128.pow(28), 0);

    let err = h
        .flow
        .buy(payer.clone(), "TINY", amount(huge))
        .await
        .unwrap_err();

    // The units do not fit in a decimal; retrying cannot help.
    assert!(matches!(
        err,
        ConfirmError::CompletionActionFailed { attempts: 1, .. }
    ));
    let wallet = h.ledger.wallet(&payer).await.unwrap().unwrap();
    assert_eq!(wallet.balance, Balance::new(huge));
    assert_eq!(wallet.holding("TINY"), Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_lost_push_response_leaves_operation_open() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200011");
    h.script(
        payer.as_str(),
        GatewayScript {
            lose_push_response: true,
            ..GatewayScript::replying([Completed])
        },
    );

    let err = h
        .flow
        .start(NewOperation::deposit(payer.clone(), amount(dec!(12))))
        .await
        .unwrap_err();

    let ConfirmError::PushUnconfirmed { operation, .. } = err else {
        panic!("expected an unconfirmed push");
    };
    let record = h.record(&operation).await;
    assert_eq!(record.status, OperationStatus::GatewayRequestSent);
    assert!(record.gateway_correlation_id.is_none());
    // The prompt did reach the payer
    assert_eq!(h.gateway.push_count(), 1);

    h.webhook(&operation, OperationStatus::Succeeded, Duration::from_secs(3));
    let action = CountingAction::new();
    assert_eq!(h.confirm(&operation, &action).await.unwrap(), Outcome::Succeeded);
    assert_eq!(action.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deposit_with_lost_push_response_is_still_confirmed() {
    let h = Harness::new();
    let payer = PayerReference::new("254711200012");
    h.script(
        payer.as_str(),
        GatewayScript {
            lose_push_response: true,
            ..GatewayScript::default()
        },
    );

    // No correlation id to poll and no webhook: the deadline decides.
    let outcome = h.flow.deposit(payer.clone(), amount(dec!(44))).await.unwrap();

    assert_eq!(outcome, Outcome::TimedOut);
    assert_eq!(h.gateway.query_count(), 0);
    assert!(h.ledger.wallet(&payer).await.unwrap().is_none());
}
