//! Event handlers wiring the bus to the dispatch services

use crate::service::PaymentToSubmitterService;
use crate::store::PaymentModelsProvider;
use crate::{DispatchError, Result};
use async_trait::async_trait;
use disbursement_core::{PaymentStatus, TenantManager};
use message_bus::{
    EventHandler, EventPaymentCompletedData, EventPaymentsReadyToPayData, Message,
    CIRCLE_PAYMENT_READY_TO_PAY_TOPIC, PAYMENT_COMPLETED_ERROR_TYPE,
    PAYMENT_COMPLETED_SUCCESS_TYPE, PAYMENT_COMPLETED_TOPIC, PAYMENT_READY_TO_PAY_TOPIC,
    PAYMENT_READY_TO_PAY_TYPE,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Dispatches the payments of a ready-to-pay event
pub struct PaymentReadyToPayHandler {
    name: &'static str,
    topic: &'static str,
    service: Arc<PaymentToSubmitterService>,
}

impl PaymentReadyToPayHandler {
    /// Handler for ledger ready-to-pay events
    pub fn stellar(service: Arc<PaymentToSubmitterService>) -> Self {
        Self {
            name: "stellar_payment_ready_to_pay",
            topic: PAYMENT_READY_TO_PAY_TOPIC,
            service,
        }
    }

    /// Handler for custodial ready-to-pay events
    pub fn circle(service: Arc<PaymentToSubmitterService>) -> Self {
        Self {
            name: "circle_payment_ready_to_pay",
            topic: CIRCLE_PAYMENT_READY_TO_PAY_TOPIC,
            service,
        }
    }
}

#[async_trait]
impl EventHandler for PaymentReadyToPayHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn can_handle(&self, message: &Message) -> bool {
        message.topic == self.topic && message.message_type == PAYMENT_READY_TO_PAY_TYPE
    }

    async fn handle(&self, message: &Message) -> message_bus::Result<()> {
        let data: EventPaymentsReadyToPayData = message.data_as()?;
        if data.tenant_id != message.tenant_id {
            return Err(message_bus::Error::handler(
                self.name,
                format!(
                    "event tenant {} does not match message tenant {}",
                    data.tenant_id, message.tenant_id
                ),
            ));
        }

        let dispatched = self
            .service
            .send_payments_ready_to_pay(&data)
            .await
            .map_err(|e| message_bus::Error::handler(self.name, e))?;
        info!(
            handler = self.name,
            tenant_id = %data.tenant_id,
            dispatched,
            "Handled ready-to-pay event"
        );
        Ok(())
    }
}

/// Mirrors submission outcomes on the payments
pub struct PaymentCompletedHandler {
    tenants: Arc<dyn TenantManager>,
    models: Arc<dyn PaymentModelsProvider>,
}

impl PaymentCompletedHandler {
    /// Create a handler
    pub fn new(tenants: Arc<dyn TenantManager>, models: Arc<dyn PaymentModelsProvider>) -> Self {
        Self { tenants, models }
    }

    async fn complete(&self, tenant_id: &str, data: &EventPaymentCompletedData) -> Result<()> {
        let status = PaymentStatus::from_str(&data.payment_status)?;
        if !matches!(status, PaymentStatus::Success | PaymentStatus::Failed) {
            return Err(DispatchError::InvalidRequest(format!(
                "payment {} cannot complete with status {}",
                data.payment_id, status
            )));
        }

        let tenant = self.tenants.get_tenant_by_id(tenant_id).await?;
        let models = self.models.models_for(&tenant).await?;
        let payment = models.payments.get(&data.payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            warn!(
                tenant_id,
                payment_id = %payment.id,
                status = %payment.status,
                "Payment is not pending, ignoring completion"
            );
            return Ok(());
        }

        models
            .payments
            .update_status(
                &payment.id,
                status,
                &data.payment_status_message,
                Some(data.stellar_transaction_id.as_str()),
            )
            .await?;
        info!(
            tenant_id,
            payment_id = %payment.id,
            status = %status,
            tx_hash = %data.stellar_transaction_id,
            "Payment completed"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PaymentCompletedHandler {
    fn name(&self) -> &str {
        "payment_completed"
    }

    fn can_handle(&self, message: &Message) -> bool {
        message.topic == PAYMENT_COMPLETED_TOPIC
            && (message.message_type == PAYMENT_COMPLETED_SUCCESS_TYPE
                || message.message_type == PAYMENT_COMPLETED_ERROR_TYPE)
    }

    async fn handle(&self, message: &Message) -> message_bus::Result<()> {
        let data: EventPaymentCompletedData = message.data_as()?;
        self.complete(&message.tenant_id, &data)
            .await
            .map_err(|e| message_bus::Error::handler(self.name(), e))
    }
}
