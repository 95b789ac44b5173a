//! Account funding from the host account

mod common;

use common::Harness;
use disbursement_core::RetryPolicy;
use ledger_client::{Asset, KeyPair, LedgerError, ResultCodes};
use rust_decimal::Decimal;
use std::time::Duration;
use submission::{AccountFunder, SubmissionError};

fn funder(h: &Harness) -> AccountFunder {
    AccountFunder::new(h.ledger.clone(), h.signatures.clone()).with_retry_policy(
        RetryPolicy::create_and_fund_account()
            .without_jitter()
            .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
    )
}

#[tokio::test]
async fn test_funds_new_account() {
    let h = Harness::new().await;
    let destination = KeyPair::generate().address();

    funder(&h)
        .create_and_fund_account(&destination, Decimal::from(5))
        .await
        .unwrap();

    assert_eq!(h.ledger.balance(&destination, &Asset::native()), Decimal::from(5));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = Harness::new().await;
    let destination = KeyPair::generate().address();
    h.ledger.fail_next_submission(LedgerError::Timeout);
    h.ledger.fail_next_submission(LedgerError::Http {
        status: 503,
        detail: "unavailable".to_string(),
    });

    funder(&h)
        .create_and_fund_account(&destination, Decimal::from(5))
        .await
        .unwrap();

    assert_eq!(h.ledger.submission_count(), 3);
    assert!(h.ledger.exists(&destination));
}

#[tokio::test]
async fn test_terminal_rejection_aborts() {
    let h = Harness::new().await;
    let destination = KeyPair::generate().address();
    h.ledger
        .fail_next_submission(LedgerError::Rejected(ResultCodes::transaction("tx_bad_auth")));

    let err = funder(&h)
        .create_and_fund_account(&destination, Decimal::from(5))
        .await
        .unwrap_err();

    assert!(err.ledger_error().map_or(false, |e| e.is_terminal()));
    assert_eq!(h.ledger.submission_count(), 1);
    assert!(!h.ledger.exists(&destination));
}

#[tokio::test]
async fn test_rejects_invalid_requests() {
    let h = Harness::new().await;
    let funder = funder(&h);

    let err = funder
        .create_and_fund_account(&h.host.address(), Decimal::from(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::InvalidTransaction(_)));

    let err = funder
        .create_and_fund_account(&KeyPair::generate().address(), Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::InvalidTransaction(_)));
    assert_eq!(h.ledger.submission_count(), 0);
}
