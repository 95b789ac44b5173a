mod common;

use chrono::Utc;
use common::*;
use disbursement_core::{PaymentStatus, ReceiverWalletStatus, RequestContext, TenantManager};
use dispatch::store::PaymentStore;
use dispatch::{CircleApiType, PaymentCompletedHandler, PaymentReadyToPayHandler};
use message_bus::{
    EventHandler, EventPaymentCompletedData, EventPaymentsReadyToPayData, Message,
    CIRCLE_PAYMENT_READY_TO_PAY_TOPIC, PAYMENT_COMPLETED_SUCCESS_TYPE, PAYMENT_COMPLETED_TOPIC,
    PAYMENT_READY_TO_PAY_TOPIC, PAYMENT_READY_TO_PAY_TYPE,
};
use std::sync::Arc;
use submission::{SubmitterTransactionStore, TransactionStatus};
use tokio_test::{assert_err, assert_ok};

async fn stellar_ctx(harness: &Harness) -> RequestContext {
    let tenant = harness.tenants.get_tenant_by_id(STELLAR_TENANT).await.unwrap();
    RequestContext::for_tenant(Arc::new(tenant))
}

#[tokio::test]
async fn test_batch_queues_submitter_transactions() {
    let harness = Harness::new();
    add_payment(&harness.stellar, "p1", "10.5", wallet("rw1"));
    add_payment(&harness.stellar, "p2", "3", wallet("rw2"));
    let service = harness.service(CircleApiType::Transfers);

    let dispatched = service
        .send_batch_payments(&stellar_ctx(&harness).await, 10)
        .await
        .unwrap();
    assert_eq!(dispatched, 2);

    for id in ["p1", "p2"] {
        let payment = harness.stellar.payments.payment(id).unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);

        let rows = harness.submitter.list_by_external_id(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Pending);
        assert_eq!(rows[0].tenant_id, STELLAR_TENANT);
        assert_eq!(rows[0].asset_code, "USDC");
    }
    let p1 = harness.submitter.list_by_external_id("p1").await.unwrap();
    assert_eq!(p1[0].destination, "GADDRRW1");
    assert_eq!(p1[0].amount.to_string(), "10.5000000");
    assert!(p1[0].memo.is_none());

    // Nothing left to pick up.
    let again = service
        .send_batch_payments(&stellar_ctx(&harness).await, 10)
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_invalid_payment_does_not_block_batch() {
    let harness = Harness::new();
    add_payment(&harness.stellar, "p1", "10", wallet("rw1"));
    add_payment(&harness.stellar, "p2", "-1", wallet("rw2"));
    let service = harness.service(CircleApiType::Transfers);

    let event = EventPaymentsReadyToPayData::new(STELLAR_TENANT, ["p1", "p2"]);
    let dispatched = service.send_payments_ready_to_pay(&event).await.unwrap();
    assert_eq!(dispatched, 1);

    let failed = harness.stellar.payments.payment("p2").unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(failed.status_message(), "payment amount is invalid for payment p2");
    assert!(harness.submitter.list_by_external_id("p2").await.unwrap().is_empty());

    assert_eq!(
        harness.stellar.payments.payment("p1").unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn test_unregistered_wallet_fails_event_payment() {
    let harness = Harness::new();
    let mut unregistered = wallet("rw1");
    unregistered.status = ReceiverWalletStatus::Ready;
    add_payment(&harness.stellar, "p1", "10", unregistered);
    let service = harness.service(CircleApiType::Transfers);

    let event = EventPaymentsReadyToPayData::new(STELLAR_TENANT, ["p1"]);
    assert_eq!(service.send_payments_ready_to_pay(&event).await.unwrap(), 0);

    let payment = harness.stellar.payments.payment("p1").unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.status_message(),
        "receiver wallet rw1 for payment p1 is not in REGISTERED state"
    );
}

#[tokio::test]
async fn test_wallet_memo_is_queued() {
    let harness = Harness::new();
    let mut with_memo = wallet("rw1");
    with_memo.stellar_memo = Some("4242".to_string());
    with_memo.stellar_memo_type = Some("id".to_string());
    add_payment(&harness.stellar, "p1", "10", with_memo);
    add_payment(&harness.stellar, "p2", "10", wallet("rw2"));
    harness.stellar.organizations.set_memo_tracing(true);

    harness
        .service(CircleApiType::Transfers)
        .send_batch_payments(&stellar_ctx(&harness).await, 10)
        .await
        .unwrap();

    let p1 = &harness.submitter.list_by_external_id("p1").await.unwrap()[0];
    assert_eq!(p1.memo.as_deref(), Some("4242"));
    assert_eq!(p1.memo_type.as_deref(), Some("id"));

    let p2 = &harness.submitter.list_by_external_id("p2").await.unwrap()[0];
    assert!(p2.memo.as_deref().unwrap().starts_with("sdp-"));
    assert_eq!(p2.memo_type.as_deref(), Some("text"));
}

#[tokio::test]
async fn test_ready_to_pay_handler() {
    let harness = Harness::new();
    add_payment(&harness.stellar, "p1", "10", wallet("rw1"));
    let service = Arc::new(harness.service(CircleApiType::Transfers));
    let handler = PaymentReadyToPayHandler::stellar(service.clone());

    let data = EventPaymentsReadyToPayData::new(STELLAR_TENANT, ["p1"]);
    let message = Message::new(
        PAYMENT_READY_TO_PAY_TOPIC,
        "p1",
        STELLAR_TENANT,
        PAYMENT_READY_TO_PAY_TYPE,
        &data,
    )
    .unwrap();
    assert!(handler.can_handle(&message));

    let mut other_topic = message.clone();
    other_topic.topic = CIRCLE_PAYMENT_READY_TO_PAY_TOPIC.to_string();
    assert!(!handler.can_handle(&other_topic));
    assert!(PaymentReadyToPayHandler::circle(service).can_handle(&other_topic));

    assert_ok!(handler.handle(&message).await);
    assert_eq!(
        harness.stellar.payments.payment("p1").unwrap().status,
        PaymentStatus::Pending
    );
    assert_eq!(harness.submitter.list_by_external_id("p1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_ready_to_pay_handler_rejects_tenant_mismatch() {
    let harness = Harness::new();
    let handler = PaymentReadyToPayHandler::stellar(Arc::new(harness.service(CircleApiType::Transfers)));
    let data = EventPaymentsReadyToPayData::new(CIRCLE_TENANT, ["p1"]);
    let message = Message::new(
        PAYMENT_READY_TO_PAY_TOPIC,
        "p1",
        STELLAR_TENANT,
        PAYMENT_READY_TO_PAY_TYPE,
        &data,
    )
    .unwrap();
    assert_err!(handler.handle(&message).await);
}

#[tokio::test]
async fn test_payment_completed_handler() {
    let harness = Harness::new();
    add_payment(&harness.stellar, "p1", "10", wallet("rw1"));
    harness
        .stellar
        .payments
        .update_status("p1", PaymentStatus::Pending, "", None)
        .await
        .unwrap();
    let handler = PaymentCompletedHandler::new(harness.tenants.clone(), harness.provider.clone());

    let data = EventPaymentCompletedData {
        transaction_id: "tx-1".to_string(),
        payment_id: "p1".to_string(),
        payment_status: "SUCCESS".to_string(),
        payment_status_message: String::new(),
        payment_completed_at: Utc::now(),
        stellar_transaction_id: "abc123".to_string(),
    };
    let message = Message::new(
        PAYMENT_COMPLETED_TOPIC,
        "p1",
        STELLAR_TENANT,
        PAYMENT_COMPLETED_SUCCESS_TYPE,
        &data,
    )
    .unwrap();
    assert!(handler.can_handle(&message));
    handler.handle(&message).await.unwrap();

    let payment = harness.stellar.payments.payment("p1").unwrap();
    assert_eq!(payment.status, PaymentStatus::Success);
    assert_eq!(payment.stellar_transaction_id.as_deref(), Some("abc123"));

    // A replayed event leaves the settled payment alone.
    handler.handle(&message).await.unwrap();
    assert_eq!(harness.stellar.payments.payment("p1").unwrap().status_history.len(), 3);
}
