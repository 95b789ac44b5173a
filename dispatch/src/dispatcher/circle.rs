//! Custodial dispatcher: sends transfers or payouts through the provider

use super::PaymentDispatcher;
use crate::custodial::{
    is_destination_address_error, transfer_status_to_payment_status, CustodialClient,
    PayoutRequest, RecipientRequest, Transfer, TransferRequest, STELLAR_CHAIN_CODE,
};
use crate::memo::MemoResolver;
use crate::metrics::PAYMENTS_DISPATCHED;
use crate::store::{
    CircleRecipient, CircleRecipientStatus, CircleRecipientUpdate, CircleTransferRequest,
    CircleTransferRequestUpdate, CircleTransferStatus, PaymentModels,
};
use crate::{DispatchError, Result, ValidationError};
use async_trait::async_trait;
use chrono::Utc;
use disbursement_core::{
    DistributionAccountResolver, Payment, PaymentBatch, PaymentStatus, Platform, ReceiverWallet,
    RequestContext, RetryPolicy,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Recipient creation attempts before a receiver wallet is given up on
pub const MAX_RECIPIENT_SYNC_ATTEMPTS: u32 = 5;

/// Provider API used to move funds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircleApiType {
    /// Transfers to a blockchain address
    Transfers,
    /// Payouts to an address book recipient
    Payouts,
}

impl CircleApiType {
    /// Lowercase name used in status messages
    pub fn as_str(&self) -> &'static str {
        match self {
            CircleApiType::Transfers => "transfer",
            CircleApiType::Payouts => "payout",
        }
    }
}

/// Sends each payment as its own provider request. A provider failure marks only that
/// payment Failed; the transfer request stays incomplete so a later attempt replays
/// its idempotency key.
pub struct CirclePaymentDispatcher {
    resolver: Arc<dyn DistributionAccountResolver>,
    client: Arc<dyn CustodialClient>,
    api_type: CircleApiType,
    recipient_retry: RetryPolicy,
}

impl CirclePaymentDispatcher {
    /// Create a dispatcher
    pub fn new(
        resolver: Arc<dyn DistributionAccountResolver>,
        client: Arc<dyn CustodialClient>,
        api_type: CircleApiType,
    ) -> Self {
        Self {
            resolver,
            client,
            api_type,
            recipient_retry: RetryPolicy::custodial_recipient(),
        }
    }

    /// Override the retry policy used while waiting for a recipient to become active
    pub fn with_recipient_retry(mut self, policy: RetryPolicy) -> Self {
        self.recipient_retry = policy;
        self
    }

    async fn fail_payment(&self, models: &PaymentModels, payment: &Payment, message: &str) -> Result<()> {
        models
            .payments
            .update_status(&payment.id, PaymentStatus::Failed, message, None)
            .await?;
        PAYMENTS_DISPATCHED
            .with_label_values(&[Platform::Circle.as_str(), "failed"])
            .inc();
        Ok(())
    }

    /// Persist the provider's answer on the request, then mirror it on the payment
    async fn record_outcome(
        &self,
        models: &PaymentModels,
        payment: &Payment,
        request: &CircleTransferRequest,
        source_wallet_id: &str,
        outcome: &Transfer,
    ) -> Result<()> {
        let payment_status = transfer_status_to_payment_status(&outcome.status)?;
        let transfer_status = CircleTransferStatus::from_str(&outcome.status)?;

        let mut update = CircleTransferRequestUpdate {
            status: Some(transfer_status),
            response_body: Some(serde_json::to_value(outcome)?),
            source_wallet_id: Some(source_wallet_id.to_string()),
            completed_at: transfer_status.is_completed().then(Utc::now),
            ..Default::default()
        };
        match self.api_type {
            CircleApiType::Transfers => update.circle_transfer_id = Some(outcome.id.clone()),
            CircleApiType::Payouts => update.circle_payout_id = Some(outcome.id.clone()),
        }
        models
            .transfer_requests
            .update(&request.idempotency_key, &update)
            .await?;
        models
            .payments
            .set_circle_transfer_id(&payment.id, &outcome.id)
            .await?;

        let message = match self.api_type {
            CircleApiType::Transfers => format!("Transfer {} is {} in Circle", outcome.id, outcome.status),
            CircleApiType::Payouts => format!("Payout {} has status={} in Circle", outcome.id, outcome.status),
        };
        models
            .payments
            .update_status(
                &payment.id,
                payment_status,
                &message,
                outcome.transaction_hash.as_deref(),
            )
            .await?;

        PAYMENTS_DISPATCHED
            .with_label_values(&[Platform::Circle.as_str(), payment_status.as_str()])
            .inc();
        info!(
            payment_id = %payment.id,
            circle_id = %outcome.id,
            status = %outcome.status,
            "Sent payment through custodial provider"
        );
        Ok(())
    }

    async fn send_transfer(
        &self,
        models: &PaymentModels,
        memos: &MemoResolver,
        payment: &Payment,
        wallet: &ReceiverWallet,
        source_wallet_id: &str,
    ) -> Result<()> {
        let request = models.transfer_requests.get_or_insert(&payment.id).await?;
        let memo = memos.get_memo(wallet).await?;

        let sent = self
            .client
            .send_transfer(&TransferRequest {
                idempotency_key: request.idempotency_key.clone(),
                source_wallet_id: source_wallet_id.to_string(),
                destination_address: wallet.stellar_address.clone(),
                destination_memo: memo.map(|m| m.value),
                amount: payment.amount.clone(),
                asset_code: payment.asset.code.clone(),
            })
            .await;

        match sent {
            Ok(transfer) => {
                self.record_outcome(models, payment, &request, source_wallet_id, &transfer)
                    .await
            }
            Err(e) if e.is_custodial() => {
                warn!(payment_id = %payment.id, error = %e, "Custodial transfer failed");
                self.fail_payment(models, payment, &e.to_string()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn send_payout(
        &self,
        models: &PaymentModels,
        payment: &Payment,
        wallet: &ReceiverWallet,
        source_wallet_id: &str,
    ) -> Result<()> {
        let recipient = match self.ensure_recipient_ready_with_retry(models, wallet).await {
            Ok(recipient) => recipient,
            Err(e) => {
                warn!(payment_id = %payment.id, receiver_wallet_id = %wallet.id, error = %e, "Custodial recipient not ready");
                let message = format!(
                    "failed to ensure custodial recipient for payment {}: {}",
                    payment.id, e
                );
                return self.fail_payment(models, payment, &message).await;
            }
        };
        let recipient_id = recipient.circle_recipient_id.clone().ok_or_else(|| {
            DispatchError::InvalidRequest(format!("recipient for receiver wallet {} has no id", wallet.id))
        })?;

        let request = models.transfer_requests.get_or_insert(&payment.id).await?;
        let sent = self
            .client
            .send_payout(&PayoutRequest {
                idempotency_key: request.idempotency_key.clone(),
                source_wallet_id: source_wallet_id.to_string(),
                recipient_id,
                amount: payment.amount.clone(),
                asset_code: payment.asset.code.clone(),
            })
            .await;

        match sent {
            Ok(payout) => {
                self.record_outcome(models, payment, &request, source_wallet_id, &payout)
                    .await
            }
            Err(e) if e.is_custodial() => {
                if is_destination_address_error(&e) {
                    models
                        .recipients
                        .update(
                            &wallet.id,
                            &CircleRecipientUpdate {
                                status: Some(CircleRecipientStatus::Denied),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                warn!(payment_id = %payment.id, error = %e, "Custodial payout failed");
                self.fail_payment(models, payment, &e.to_string()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_recipient_ready_with_retry(
        &self,
        models: &PaymentModels,
        wallet: &ReceiverWallet,
    ) -> Result<CircleRecipient> {
        self.recipient_retry
            .run(
                "ensure_custodial_recipient",
                |e: &DispatchError| !matches!(e, DispatchError::RecipientCreationFailedTooManyTimes),
                |_attempt| async move {
                    let recipient = self.ensure_recipient_ready(models, wallet).await?;
                    match recipient.status {
                        Some(CircleRecipientStatus::Active) => Ok(recipient),
                        other => Err(DispatchError::RecipientNotReady(
                            other.map(|s| s.to_string()).unwrap_or_default(),
                        )),
                    }
                },
            )
            .await
    }

    /// Create or refresh the provider recipient of a receiver wallet
    async fn ensure_recipient_ready(
        &self,
        models: &PaymentModels,
        wallet: &ReceiverWallet,
    ) -> Result<CircleRecipient> {
        let mut recipient = match models.recipients.get_by_receiver_wallet_id(&wallet.id).await? {
            Some(recipient) => recipient,
            None => models.recipients.insert(&wallet.id).await?,
        };

        if recipient.sync_attempts >= MAX_RECIPIENT_SYNC_ATTEMPTS {
            return Err(DispatchError::RecipientCreationFailedTooManyTimes);
        }
        if recipient.status == Some(CircleRecipientStatus::Active) {
            return Ok(recipient);
        }
        if recipient.status.map_or(false, |s| s.needs_new_idempotency_key()) {
            recipient = models
                .recipients
                .update(
                    &wallet.id,
                    &CircleRecipientUpdate {
                        idempotency_key: Some(Uuid::new_v4().to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            debug!(receiver_wallet_id = %wallet.id, "Renewed custodial recipient idempotency key");
        }

        let posted = self
            .client
            .post_recipient(&RecipientRequest {
                idempotency_key: recipient.idempotency_key.clone(),
                address: wallet.stellar_address.clone(),
                address_tag: wallet.stellar_memo.clone(),
                chain: STELLAR_CHAIN_CODE.to_string(),
                nickname: wallet.id.clone(),
            })
            .await;
        let now = Utc::now();

        match posted {
            Ok(created) => {
                let status = CircleRecipientStatus::from_str(&created.status)?;
                models
                    .recipients
                    .update(
                        &wallet.id,
                        &CircleRecipientUpdate {
                            circle_recipient_id: Some(created.id.clone()),
                            status: Some(status),
                            response_body: Some(serde_json::to_value(&created)?),
                            sync_attempts: Some(recipient.sync_attempts + 1),
                            last_sync_attempt_at: Some(now),
                            ..Default::default()
                        },
                    )
                    .await
            }
            Err(e) => {
                error!(receiver_wallet_id = %wallet.id, error = %e, "Custodial recipient creation failed");
                let status = if is_destination_address_error(&e) {
                    CircleRecipientStatus::Denied
                } else {
                    CircleRecipientStatus::Failed
                };
                models
                    .recipients
                    .update(
                        &wallet.id,
                        &CircleRecipientUpdate {
                            status: Some(status),
                            response_body: Some(serde_json::json!({ "error": e.to_string() })),
                            sync_attempts: Some(recipient.sync_attempts + 1),
                            last_sync_attempt_at: Some(now),
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PaymentDispatcher for CirclePaymentDispatcher {
    async fn dispatch_payments(
        &self,
        ctx: &RequestContext,
        models: &PaymentModels,
        tenant_id: &str,
        batch: &PaymentBatch,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let distribution = self.resolver.distribution_account_from_context(ctx).await?;
        if distribution.platform() != Platform::Circle {
            return Err(DispatchError::PlatformMismatch {
                tenant_id: tenant_id.to_string(),
                expected: Platform::Circle,
            });
        }
        let source_wallet_id = distribution.circle_wallet_id.clone().ok_or_else(|| {
            DispatchError::InvalidRequest(format!("tenant {} has no custodial wallet", tenant_id))
        })?;

        let memos = MemoResolver::new(models.organizations.clone());
        for payment in batch.payments() {
            let wallet = batch.receiver_wallet(payment).ok_or_else(|| {
                ValidationError::ReceiverWalletMissing {
                    wallet_id: payment.receiver_wallet_id.clone(),
                    payment_id: payment.id.clone(),
                }
            })?;

            match self.api_type {
                CircleApiType::Transfers => {
                    self.send_transfer(models, &memos, payment, wallet, &source_wallet_id)
                        .await?
                }
                CircleApiType::Payouts => {
                    self.send_payout(models, payment, wallet, &source_wallet_id)
                        .await?
                }
            }
        }
        Ok(())
    }

    fn supported_platform(&self) -> Platform {
        Platform::Circle
    }
}
