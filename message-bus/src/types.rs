//! Topics, event types and payload schemas

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger payments ready to be handed to the submitter
pub const PAYMENT_READY_TO_PAY_TOPIC: &str = "events.payment.ready_to_pay";

/// Custodial payments ready to be sent to the provider
pub const CIRCLE_PAYMENT_READY_TO_PAY_TOPIC: &str = "events.circle-payment.ready_to_pay";

/// Submission outcomes
pub const PAYMENT_COMPLETED_TOPIC: &str = "events.payment.payment_completed";

/// Ready-to-pay event type
pub const PAYMENT_READY_TO_PAY_TYPE: &str = "payment-ready-to-pay";

/// Ledger transaction confirmed
pub const PAYMENT_COMPLETED_SUCCESS_TYPE: &str = "payment-completed-success";

/// Ledger transaction failed for good
pub const PAYMENT_COMPLETED_ERROR_TYPE: &str = "payment-completed-error";

/// Every topic the engine produces to or consumes from
pub const ALL_TOPICS: [&str; 3] = [
    PAYMENT_READY_TO_PAY_TOPIC,
    CIRCLE_PAYMENT_READY_TO_PAY_TOPIC,
    PAYMENT_COMPLETED_TOPIC,
];

/// One payment in a ready-to-pay event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReadyToPay {
    /// Payment id
    pub id: String,
}

/// Payload of a ready-to-pay event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPaymentsReadyToPayData {
    /// Tenant owning the payments
    pub tenant_id: String,
    /// Payments to dispatch
    pub payments: Vec<PaymentReadyToPay>,
}

impl EventPaymentsReadyToPayData {
    /// Build from payment ids
    pub fn new<I, S>(tenant_id: impl Into<String>, payment_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenant_id: tenant_id.into(),
            payments: payment_ids
                .into_iter()
                .map(|id| PaymentReadyToPay { id: id.into() })
                .collect(),
        }
    }
}

/// Payload of a payment-completed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPaymentCompletedData {
    /// Submitter transaction id
    pub transaction_id: String,
    /// Payment id
    pub payment_id: String,
    /// Final payment status
    pub payment_status: String,
    /// Failure reason, empty on success
    pub payment_status_message: String,
    /// When the outcome was known
    pub payment_completed_at: DateTime<Utc>,
    /// Ledger transaction hash
    pub stellar_transaction_id: String,
}
