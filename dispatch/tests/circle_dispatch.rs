mod common;

use common::*;
use disbursement_core::{PaymentStatus, RequestContext, TenantManager};
use dispatch::store::{
    CircleRecipientStatus, CircleRecipientStore, CircleRecipientUpdate, CircleTransferStatus,
    PaymentStore,
};
use dispatch::{CircleApiType, CustodialApiError, DispatchError, MockCustodialClient};
use std::sync::Arc;
use std::time::Duration;

async fn circle_ctx(harness: &Harness) -> RequestContext {
    let tenant = harness.tenants.get_tenant_by_id(CIRCLE_TENANT).await.unwrap();
    RequestContext::for_tenant(Arc::new(tenant))
}

fn api_error(code: i64, message: &str) -> CustodialApiError {
    CustodialApiError {
        status_code: 400,
        code,
        message: message.to_string(),
    }
}

#[tokio::test]
async fn test_transfer_success_records_request() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    let service = harness.service(CircleApiType::Transfers);

    let dispatched = service
        .send_batch_payments(&circle_ctx(&harness).await, 10)
        .await
        .unwrap();
    assert_eq!(dispatched, 1);

    let sent = harness.custodial.transfer_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].source_wallet_id, CIRCLE_WALLET);
    assert_eq!(sent[0].destination_address, "GADDRRW1");
    assert_eq!(sent[0].amount, "25");

    let requests = harness.circle.transfer_requests.list_by_payment_id("p1");
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.idempotency_key, sent[0].idempotency_key);
    assert_eq!(request.status, Some(CircleTransferStatus::Pending));
    assert_eq!(request.source_wallet_id.as_deref(), Some(CIRCLE_WALLET));
    assert!(request.response_body.is_some());
    assert!(request.completed_at.is_none());

    let payment = harness.circle.payments.payment("p1").unwrap();
    let transfer_id = request.circle_transfer_id.clone().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.circle_transfer_id.as_deref(), Some(transfer_id.as_str()));
    assert_eq!(
        payment.status_message(),
        format!("Transfer {} is pending in Circle", transfer_id)
    );
}

#[tokio::test]
async fn test_concurrent_batches_send_each_payment_once() {
    let mut harness = Harness::new();
    harness.custodial = Arc::new(MockCustodialClient::new().with_latency(Duration::from_millis(20)));
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    let service = harness.service(CircleApiType::Transfers);
    let ctx = circle_ctx(&harness).await;

    let (first, second) = tokio::join!(
        service.send_batch_payments(&ctx, 10),
        service.send_batch_payments(&ctx, 10)
    );
    assert_eq!(first.unwrap() + second.unwrap(), 1);

    assert_eq!(harness.custodial.transfer_requests().len(), 1);
    assert_eq!(harness.circle.transfer_requests.list_by_payment_id("p1").len(), 1);
    assert_eq!(
        harness.circle.payments.payment("p1").unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn test_transfer_completed_immediately() {
    let harness = Harness::new();
    harness.custodial.set_initial_status("complete");
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));

    harness
        .service(CircleApiType::Transfers)
        .send_batch_payments(&circle_ctx(&harness).await, 10)
        .await
        .unwrap();

    let request = &harness.circle.transfer_requests.list_by_payment_id("p1")[0];
    assert_eq!(request.status, Some(CircleTransferStatus::Success));
    assert!(request.completed_at.is_some());
    assert_eq!(
        harness.circle.payments.payment("p1").unwrap().status,
        PaymentStatus::Success
    );
}

#[tokio::test]
async fn test_provider_failure_fails_only_that_payment() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    add_payment(&harness.circle, "p2", "30", wallet("rw2"));
    harness.custodial.fail_next(api_error(2, "insufficient funds"));

    harness
        .service(CircleApiType::Transfers)
        .send_batch_payments(&circle_ctx(&harness).await, 10)
        .await
        .unwrap();

    let failed = harness.circle.payments.payment("p1").unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert!(failed.status_message().contains("insufficient funds"));
    assert_eq!(
        harness.circle.payments.payment("p2").unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn test_retry_after_failure_replays_idempotency_key() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    harness.custodial.fail_next(api_error(2, "insufficient funds"));
    let service = harness.service(CircleApiType::Transfers);
    let ctx = circle_ctx(&harness).await;

    service.send_batch_payments(&ctx, 10).await.unwrap();
    assert_eq!(
        harness.circle.payments.payment("p1").unwrap().status,
        PaymentStatus::Failed
    );

    // An operator readies the payment again.
    harness
        .circle
        .payments
        .update_statuses(&["p1".to_string()], PaymentStatus::Ready, "retry")
        .await
        .unwrap();
    service.send_batch_payments(&ctx, 10).await.unwrap();

    let sent = harness.custodial.transfer_requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].idempotency_key, sent[1].idempotency_key);
    assert_eq!(harness.circle.transfer_requests.list_by_payment_id("p1").len(), 1);
    assert_eq!(
        harness.circle.payments.payment("p1").unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn test_payout_creates_recipient_first() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    harness.custodial.script_recipient_statuses(["pending", "active"]);

    harness
        .service(CircleApiType::Payouts)
        .send_batch_payments(&circle_ctx(&harness).await, 10)
        .await
        .unwrap();

    let recipient = harness
        .circle
        .recipients
        .get_by_receiver_wallet_id("rw1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recipient.status, Some(CircleRecipientStatus::Active));
    assert_eq!(recipient.sync_attempts, 2);

    let recipient_requests = harness.custodial.recipient_requests();
    assert_eq!(recipient_requests.len(), 2);
    assert_eq!(recipient_requests[0].idempotency_key, recipient_requests[1].idempotency_key);
    assert_eq!(recipient_requests[0].address, "GADDRRW1");

    let payouts = harness.custodial.payout_requests();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].recipient_id, recipient.circle_recipient_id.clone().unwrap());

    let payment = harness.circle.payments.payment("p1").unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.status_message().starts_with("Payout "));
    assert!(harness.circle.transfer_requests.list_by_payment_id("p1")[0]
        .circle_payout_id
        .is_some());
}

#[tokio::test]
async fn test_failed_recipient_renews_idempotency_key() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    harness.custodial.script_recipient_statuses(["failed", "active"]);

    harness
        .service(CircleApiType::Payouts)
        .send_batch_payments(&circle_ctx(&harness).await, 10)
        .await
        .unwrap();

    let requests = harness.custodial.recipient_requests();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].idempotency_key, requests[1].idempotency_key);
    assert_eq!(
        harness.circle.payments.payment("p1").unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn test_recipient_gives_up_after_max_attempts() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    harness
        .custodial
        .script_recipient_statuses(["pending", "pending", "pending", "pending", "pending", "pending"]);

    harness
        .service(CircleApiType::Payouts)
        .send_batch_payments(&circle_ctx(&harness).await, 10)
        .await
        .unwrap();

    assert_eq!(harness.custodial.recipient_requests().len(), 5);
    assert!(harness.custodial.payout_requests().is_empty());

    let payment = harness.circle.payments.payment("p1").unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(payment
        .status_message()
        .contains("failed to ensure custodial recipient for payment p1"));
}

#[tokio::test]
async fn test_destination_address_error_denies_recipient() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    let service = harness.service(CircleApiType::Payouts);

    let ctx = circle_ctx(&harness).await;

    // Recipient already active, so the only creating call is the payout.
    harness
        .circle
        .recipients
        .insert("rw1")
        .await
        .unwrap();
    harness
        .circle
        .recipients
        .update(
            "rw1",
            &CircleRecipientUpdate {
                circle_recipient_id: Some("recipient-1".to_string()),
                status: Some(CircleRecipientStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    harness.custodial.fail_next(api_error(5011, "address is not allowed"));

    service.send_batch_payments(&ctx, 10).await.unwrap();

    let recipient = harness
        .circle
        .recipients
        .get_by_receiver_wallet_id("rw1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recipient.status, Some(CircleRecipientStatus::Denied));
    assert_eq!(
        harness.circle.payments.payment("p1").unwrap().status,
        PaymentStatus::Failed
    );
}

#[tokio::test]
async fn test_stellar_tenant_payments_never_reach_custodian() {
    let harness = Harness::new();
    add_payment(&harness.stellar, "p1", "25", wallet("rw1"));
    let tenant = harness.tenants.get_tenant_by_id(STELLAR_TENANT).await.unwrap();
    let ctx = RequestContext::for_tenant(Arc::new(tenant));

    harness
        .service(CircleApiType::Transfers)
        .send_batch_payments(&ctx, 10)
        .await
        .unwrap();
    assert!(harness.custodial.transfer_requests().is_empty());
}

#[tokio::test]
async fn test_missing_dispatcher_is_an_error() {
    let harness = Harness::new();
    add_payment(&harness.circle, "p1", "25", wallet("rw1"));
    let service = dispatch::PaymentToSubmitterService::new(
        harness.tenants.clone(),
        harness.resolver.clone(),
        harness.provider.clone(),
        vec![dispatch::StellarPaymentDispatcher::new(harness.resolver.clone(), harness.submitter.clone()).into()],
    );

    let result = service.send_batch_payments(&circle_ctx(&harness).await, 10).await;
    assert!(matches!(result, Err(DispatchError::NoDispatcher(_))));
    assert_eq!(
        harness.circle.payments.payment("p1").unwrap().status,
        PaymentStatus::Ready
    );
}
