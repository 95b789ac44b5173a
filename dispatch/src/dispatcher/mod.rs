//! Platform dispatchers
//!
//! A dispatcher hands a batch of validated payments to one settlement rail. The rail is
//! chosen by the platform of the tenant's distribution account.

mod circle;
mod stellar;

pub use circle::{CircleApiType, CirclePaymentDispatcher, MAX_RECIPIENT_SYNC_ATTEMPTS};
pub use stellar::StellarPaymentDispatcher;

use crate::store::PaymentModels;
use crate::Result;
use async_trait::async_trait;
use disbursement_core::{PaymentBatch, Platform, RequestContext};

/// Sends validated payments on one platform
#[async_trait]
pub trait PaymentDispatcher: Send + Sync {
    /// Hand `batch` to the platform; payment statuses are updated through `models`
    async fn dispatch_payments(
        &self,
        ctx: &RequestContext,
        models: &PaymentModels,
        tenant_id: &str,
        batch: &PaymentBatch,
    ) -> Result<()>;

    /// Platform served
    fn supported_platform(&self) -> Platform;
}

/// The dispatchers this engine ships
pub enum PlatformDispatcher {
    /// Ledger submitter
    Stellar(StellarPaymentDispatcher),
    /// Custodial provider
    Circle(CirclePaymentDispatcher),
}

#[async_trait]
impl PaymentDispatcher for PlatformDispatcher {
    async fn dispatch_payments(
        &self,
        ctx: &RequestContext,
        models: &PaymentModels,
        tenant_id: &str,
        batch: &PaymentBatch,
    ) -> Result<()> {
        match self {
            PlatformDispatcher::Stellar(d) => d.dispatch_payments(ctx, models, tenant_id, batch).await,
            PlatformDispatcher::Circle(d) => d.dispatch_payments(ctx, models, tenant_id, batch).await,
        }
    }

    fn supported_platform(&self) -> Platform {
        match self {
            PlatformDispatcher::Stellar(d) => d.supported_platform(),
            PlatformDispatcher::Circle(d) => d.supported_platform(),
        }
    }
}

impl From<StellarPaymentDispatcher> for PlatformDispatcher {
    fn from(dispatcher: StellarPaymentDispatcher) -> Self {
        PlatformDispatcher::Stellar(dispatcher)
    }
}

impl From<CirclePaymentDispatcher> for PlatformDispatcher {
    fn from(dispatcher: CirclePaymentDispatcher) -> Self {
        PlatformDispatcher::Circle(dispatcher)
    }
}
