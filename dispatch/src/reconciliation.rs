//! Polls the custodial provider for transfers still pending and settles their payments

use crate::custodial::{CustodialClient, Transfer};
use crate::metrics::TRANSFERS_RECONCILED;
use crate::store::{
    CircleTransferRequest, CircleTransferRequestUpdate, CircleTransferStatus, PaymentModels,
};
use crate::{DispatchError, Result};
use chrono::Utc;
use disbursement_core::{DistributionAccountResolver, PaymentStatus, Platform, RequestContext};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconciliation attempts per transfer request before it is left alone
pub const MAX_RECONCILIATION_SYNC_ATTEMPTS: u32 = 10;

/// Reconciles pending custodial transfer requests of one tenant at a time
pub struct CircleReconciliationService {
    resolver: Arc<dyn DistributionAccountResolver>,
    client: Arc<dyn CustodialClient>,
    max_sync_attempts: u32,
}

impl CircleReconciliationService {
    /// Create a service
    pub fn new(resolver: Arc<dyn DistributionAccountResolver>, client: Arc<dyn CustodialClient>) -> Self {
        Self {
            resolver,
            client,
            max_sync_attempts: MAX_RECONCILIATION_SYNC_ATTEMPTS,
        }
    }

    /// Override the reconciliation attempt cap
    pub fn with_max_sync_attempts(mut self, max_sync_attempts: u32) -> Self {
        self.max_sync_attempts = max_sync_attempts;
        self
    }

    /// Reconcile the pending requests of the context's tenant; returns how many changed
    pub async fn reconcile(&self, ctx: &RequestContext, models: &PaymentModels) -> Result<usize> {
        let tenant = ctx.require_tenant()?;
        let distribution = self.resolver.distribution_account_from_context(ctx).await?;
        if distribution.platform() != Platform::Circle {
            debug!(tenant_id = %tenant.id, "Distribution account is not custodial, skipping reconciliation");
            return Ok(0);
        }
        if !distribution.is_active() {
            debug!(tenant_id = %tenant.id, "Custodial distribution account is not active, skipping reconciliation");
            return Ok(0);
        }

        let requests = models
            .transfer_requests
            .get_pending_reconciliation(self.max_sync_attempts)
            .await?;
        if requests.is_empty() {
            return Ok(0);
        }

        let mut changed = 0;
        let mut errors = Vec::new();
        for request in &requests {
            match self.reconcile_request(models, request).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        tenant_id = %tenant.id,
                        payment_id = %request.payment_id,
                        error = %e,
                        "Failed to reconcile custodial transfer request"
                    );
                    errors.push(format!("{}: {}", request.payment_id, e));
                }
            }
        }

        info!(
            tenant_id = %tenant.id,
            attempted = requests.len(),
            changed,
            failed = errors.len(),
            "Reconciled custodial transfer requests"
        );
        if !errors.is_empty() {
            return Err(DispatchError::Reconciliation {
                attempted: requests.len(),
                failed: errors.len(),
                errors: errors.join("; "),
            });
        }
        Ok(changed)
    }

    async fn fetch(&self, request: &CircleTransferRequest) -> Result<(&'static str, Transfer)> {
        if let Some(payout_id) = &request.circle_payout_id {
            return Ok(("payout", self.client.get_payout_by_id(payout_id).await?));
        }
        if let Some(transfer_id) = &request.circle_transfer_id {
            return Ok(("transfer", self.client.get_transfer_by_id(transfer_id).await?));
        }
        Err(DispatchError::InvalidRequest(format!(
            "transfer request {} was never sent",
            request.idempotency_key
        )))
    }

    /// Returns whether the request changed status
    async fn reconcile_request(&self, models: &PaymentModels, request: &CircleTransferRequest) -> Result<bool> {
        let now = Utc::now();
        let sync_attempts = request.sync_attempts + 1;

        let (kind, fetched) = match self.fetch(request).await {
            Ok(fetched) => fetched,
            Err(DispatchError::Custodial(api)) if api.status_code == 400 => {
                models
                    .transfer_requests
                    .update(
                        &request.idempotency_key,
                        &CircleTransferRequestUpdate {
                            sync_attempts: Some(sync_attempts),
                            last_sync_attempt_at: Some(now),
                            response_body: Some(serde_json::to_value(&api)?),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(DispatchError::Custodial(api));
            }
            Err(e) => return Err(e),
        };

        let status = CircleTransferStatus::from_str(&fetched.status)
            .map_err(|_| DispatchError::UnknownCustodialStatus(fetched.status.clone()))?;
        if request.status == Some(status) {
            models
                .transfer_requests
                .update(
                    &request.idempotency_key,
                    &CircleTransferRequestUpdate {
                        sync_attempts: Some(sync_attempts),
                        last_sync_attempt_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(false);
        }

        models
            .transfer_requests
            .update(
                &request.idempotency_key,
                &CircleTransferRequestUpdate {
                    status: Some(status),
                    response_body: Some(serde_json::to_value(&fetched)?),
                    sync_attempts: Some(sync_attempts),
                    last_sync_attempt_at: Some(now),
                    completed_at: status.is_completed().then_some(now),
                    ..Default::default()
                },
            )
            .await?;

        let (payment_status, message) = match status {
            CircleTransferStatus::Success => (
                PaymentStatus::Success,
                format!(
                    "Circle {} completed successfully with the Stellar transaction hash: {:?}",
                    kind,
                    fetched.transaction_hash.as_deref().unwrap_or_default()
                ),
            ),
            CircleTransferStatus::Failed => (
                PaymentStatus::Failed,
                format!(
                    "Circle {} failed with error: {:?}",
                    kind,
                    fetched.error_code.as_deref().unwrap_or_default()
                ),
            ),
            CircleTransferStatus::Pending => {
                return Err(DispatchError::UnknownCustodialStatus(fetched.status.clone()))
            }
        };

        models
            .payments
            .update_status(
                &request.payment_id,
                payment_status,
                &message,
                fetched.transaction_hash.as_deref(),
            )
            .await?;
        TRANSFERS_RECONCILED
            .with_label_values(&[status.as_str()])
            .inc();
        info!(
            payment_id = %request.payment_id,
            circle_id = %fetched.id,
            status = %status,
            "Custodial {} reconciled", kind
        );
        Ok(true)
    }
}
