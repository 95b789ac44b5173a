//! Ledger dispatcher: queues submitter transactions

use super::PaymentDispatcher;
use crate::memo::MemoResolver;
use crate::metrics::PAYMENTS_DISPATCHED;
use crate::store::PaymentModels;
use crate::{DispatchError, Result, ValidationError};
use async_trait::async_trait;
use disbursement_core::payment::ledger_amount;
use disbursement_core::{
    DistributionAccountResolver, PaymentBatch, PaymentStatus, Platform, RequestContext,
};
use std::sync::Arc;
use submission::{NewSubmitterTransaction, SubmitterTransactionStore};
use tracing::info;

/// Queues one submitter transaction per payment and moves the payments to Pending.
/// Queueing is idempotent per payment, so a batch may be dispatched again after a crash
/// between the two steps.
pub struct StellarPaymentDispatcher {
    resolver: Arc<dyn DistributionAccountResolver>,
    submitter_store: Arc<dyn SubmitterTransactionStore>,
}

impl StellarPaymentDispatcher {
    /// Create a dispatcher
    pub fn new(
        resolver: Arc<dyn DistributionAccountResolver>,
        submitter_store: Arc<dyn SubmitterTransactionStore>,
    ) -> Self {
        Self {
            resolver,
            submitter_store,
        }
    }
}

#[async_trait]
impl PaymentDispatcher for StellarPaymentDispatcher {
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
        if distribution.platform() != Platform::Stellar {
            return Err(DispatchError::PlatformMismatch {
                tenant_id: tenant_id.to_string(),
                expected: Platform::Stellar,
            });
        }

        let memos = MemoResolver::new(models.organizations.clone());
        let mut transactions = Vec::with_capacity(batch.len());
        for payment in batch.payments() {
            let wallet = batch.receiver_wallet(payment).ok_or_else(|| {
                ValidationError::ReceiverWalletMissing {
                    wallet_id: payment.receiver_wallet_id.clone(),
                    payment_id: payment.id.clone(),
                }
            })?;
            let amount = ledger_amount(&payment.amount)
                .ok_or_else(|| ValidationError::InvalidAmount(payment.id.clone()))?;
            let memo = memos.get_memo(wallet).await?;

            transactions.push(NewSubmitterTransaction {
                external_id: payment.id.clone(),
                tenant_id: tenant_id.to_string(),
                asset_code: payment.asset.code.clone(),
                asset_issuer: payment.asset.issuer.clone(),
                amount,
                destination: wallet.stellar_address.clone(),
                memo: memo.as_ref().map(|m| m.value.clone()),
                memo_type: memo.map(|m| m.memo_type),
            });
        }

        let queued = self.submitter_store.bulk_get_or_insert(&transactions).await?;
        let ids = batch.payment_ids();
        models
            .payments
            .update_statuses(&ids, PaymentStatus::Pending, "")
            .await?;

        PAYMENTS_DISPATCHED
            .with_label_values(&[Platform::Stellar.as_str(), "pending"])
            .inc_by(ids.len() as u64);
        info!(
            tenant_id,
            payments = ids.len(),
            submitter_transactions = queued.len(),
            "Queued payments for ledger submission"
        );
        Ok(())
    }

    fn supported_platform(&self) -> Platform {
        Platform::Stellar
    }
}
