//! Moves ready payments from a tenant's database onto its settlement rail

use crate::dispatcher::{PaymentDispatcher, PlatformDispatcher};
use crate::metrics::PAYMENTS_DISPATCHED;
use crate::store::{PaymentModels, PaymentModelsProvider, TransactionalModels};
use crate::validation::validate_payment_ready_for_sending;
use crate::{DispatchError, Result};
use disbursement_core::{
    DistributionAccountResolver, PaymentBatch, PaymentStatus, Platform, RequestContext,
    TenantManager,
};
use message_bus::EventPaymentsReadyToPayData;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Validates ready payments and hands the valid ones to the dispatcher of the tenant's
/// distribution platform
pub struct PaymentToSubmitterService {
    tenants: Arc<dyn TenantManager>,
    resolver: Arc<dyn DistributionAccountResolver>,
    models: Arc<dyn PaymentModelsProvider>,
    dispatchers: Vec<PlatformDispatcher>,
}

impl PaymentToSubmitterService {
    /// Create a service
    pub fn new(
        tenants: Arc<dyn TenantManager>,
        resolver: Arc<dyn DistributionAccountResolver>,
        models: Arc<dyn PaymentModelsProvider>,
        dispatchers: Vec<PlatformDispatcher>,
    ) -> Self {
        Self {
            tenants,
            resolver,
            models,
            dispatchers,
        }
    }

    fn dispatcher_for(&self, platform: Platform) -> Result<&PlatformDispatcher> {
        self.dispatchers
            .iter()
            .find(|d| d.supported_platform() == platform)
            .ok_or(DispatchError::NoDispatcher(platform))
    }

    /// Dispatch the payments named in a ready-to-pay event
    pub async fn send_payments_ready_to_pay(&self, event: &EventPaymentsReadyToPayData) -> Result<usize> {
        let tenant = self.tenants.get_tenant_by_id(&event.tenant_id).await?;
        let ctx = RequestContext::for_tenant(Arc::new(tenant));
        let unit = self.begin(&ctx).await?;

        let ids: Vec<String> = event.payments.iter().map(|p| p.id.clone()).collect();
        let batch = match unit.models.payments.get_ready_by_ids(&ids).await {
            Ok(batch) => batch,
            Err(e) => return self.finish(&ctx, unit, Err(e)).await,
        };
        if batch.len() != ids.len() {
            let found: HashSet<String> = batch.payment_ids().into_iter().collect();
            let missing: Vec<&String> = ids.iter().filter(|id| !found.contains(*id)).collect();
            warn!(
                tenant_id = %event.tenant_id,
                missing = ?missing,
                "Some payments of the event are no longer ready"
            );
        }

        let sent = self.send(&ctx, &unit.models, batch).await;
        self.finish(&ctx, unit, sent).await
    }

    /// Dispatch up to `batch_size` ready payments of the context's tenant
    pub async fn send_batch_payments(&self, ctx: &RequestContext, batch_size: usize) -> Result<usize> {
        let unit = self.begin(ctx).await?;
        let sent = match unit.models.payments.get_batch_for_update(batch_size).await {
            Ok(batch) => self.send(ctx, &unit.models, batch).await,
            Err(e) => Err(e),
        };
        self.finish(ctx, unit, sent).await
    }

    /// Open the unit the selected payments stay locked in until `finish`
    async fn begin(&self, ctx: &RequestContext) -> Result<TransactionalModels> {
        let tenant = ctx.require_tenant()?;
        self.models.begin(tenant).await
    }

    /// Commit the unit even when dispatch failed part way, so the statuses of payments
    /// already handed to a rail are kept.
    async fn finish(&self, ctx: &RequestContext, unit: TransactionalModels, sent: Result<usize>) -> Result<usize> {
        match unit.commit().await {
            Ok(()) => sent,
            Err(e) => {
                error!(tenant_id = ?ctx.tenant().map(|t| &t.id), error = %e, "Committing dispatched payments failed");
                Err(sent.err().unwrap_or(e))
            }
        }
    }

    /// Validate, fail the invalid payments one by one, dispatch the rest.
    /// Returns the number of payments handed to the dispatcher.
    async fn send(&self, ctx: &RequestContext, models: &PaymentModels, batch: PaymentBatch) -> Result<usize> {
        let tenant_id = ctx.require_tenant()?.id.clone();
        if batch.is_empty() {
            debug!(tenant_id = %tenant_id, "No payments to dispatch");
            return Ok(0);
        }

        let mut invalid = Vec::new();
        for payment in batch.payments() {
            if let Err(e) = validate_payment_ready_for_sending(payment, &batch) {
                invalid.push((payment.id.clone(), e.to_string()));
            }
        }
        let invalid_ids: HashSet<&str> = invalid.iter().map(|(id, _)| id.as_str()).collect();
        let (valid, _) = batch.split_off(|p| !invalid_ids.contains(p.id.as_str()));

        for (payment_id, message) in &invalid {
            warn!(tenant_id = %tenant_id, payment_id = %payment_id, reason = %message, "Payment failed validation");
            models
                .payments
                .update_status(payment_id, PaymentStatus::Failed, message, None)
                .await?;
            PAYMENTS_DISPATCHED
                .with_label_values(&["none", "invalid"])
                .inc();
        }

        if valid.is_empty() {
            return Ok(0);
        }

        let distribution = self.resolver.distribution_account_from_context(ctx).await?;
        let dispatcher = self.dispatcher_for(distribution.platform())?;
        if let Err(e) = dispatcher
            .dispatch_payments(ctx, models, &tenant_id, &valid)
            .await
        {
            error!(tenant_id = %tenant_id, platform = %distribution.platform(), error = %e, "Payment dispatch failed");
            return Err(e);
        }

        info!(
            tenant_id = %tenant_id,
            platform = %distribution.platform(),
            dispatched = valid.len(),
            invalid = invalid.len(),
            "Dispatched payments"
        );
        Ok(valid.len())
    }
}
