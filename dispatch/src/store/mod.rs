//! Per-tenant records read and written by the dispatchers
//!
//! Payments live in the tenant database together with the custodial transfer requests
//! and recipients created for them. `PaymentModels` bundles the stores of one tenant;
//! `PaymentModelsProvider` hands them out per tenant.

mod memory;
mod postgres;

pub use memory::{
    InMemoryCircleRecipientStore, InMemoryCircleTransferRequestStore,
    InMemoryOrganizationStore, InMemoryPaymentModelsProvider, InMemoryPaymentStore,
    InMemoryStores,
};
pub use postgres::{
    PgCircleRecipientStore, PgCircleTransferRequestStore, PgOrganizationStore,
    PgPaymentModelsProvider, PgPaymentStore,
};

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use disbursement_core::{string_enum, Payment, PaymentBatch, PaymentStatus, Tenant};
use std::sync::Arc;
use uuid::Uuid;

string_enum! {
    /// Status of a custodial transfer or payout
    pub enum CircleTransferStatus {
        /// Accepted, not settled
        Pending => "pending",
        /// Settled
        Success => "complete",
        /// Failed at the provider
        Failed => "failed",
    }
}

impl CircleTransferStatus {
    /// Whether the provider will not change the status again
    pub fn is_completed(&self) -> bool {
        matches!(self, CircleTransferStatus::Success | CircleTransferStatus::Failed)
    }
}

string_enum! {
    /// Status of a custodial address book recipient
    pub enum CircleRecipientStatus {
        /// Waiting for provider approval
        Pending => "pending",
        /// Usable for payouts
        Active => "active",
        /// Disabled at the provider
        Inactive => "inactive",
        /// Creation failed
        Failed => "failed",
        /// Rejected by the provider
        Denied => "denied",
    }
}

impl CircleRecipientStatus {
    /// Whether another creation attempt needs a fresh idempotency key
    pub fn needs_new_idempotency_key(&self) -> bool {
        matches!(
            self,
            CircleRecipientStatus::Inactive
                | CircleRecipientStatus::Failed
                | CircleRecipientStatus::Denied
        )
    }
}

/// Attempt at moving one payment through the custodial provider.
/// The idempotency key is reused for every retry until the request completes.
#[derive(Debug, Clone, PartialEq)]
pub struct CircleTransferRequest {
    /// Idempotency key sent to the provider
    pub idempotency_key: String,
    /// Payment id
    pub payment_id: String,
    /// Provider transfer id
    pub circle_transfer_id: Option<String>,
    /// Provider payout id
    pub circle_payout_id: Option<String>,
    /// Last known status
    pub status: Option<CircleTransferStatus>,
    /// Last provider response
    pub response_body: Option<serde_json::Value>,
    /// Wallet the funds came from
    pub source_wallet_id: Option<String>,
    /// Reconciliation attempts so far
    pub sync_attempts: u32,
    /// Last reconciliation attempt
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    /// When the request reached a final status
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl CircleTransferRequest {
    /// New request for a payment
    pub fn new(payment_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key: Uuid::new_v4().to_string(),
            payment_id: payment_id.into(),
            circle_transfer_id: None,
            circle_payout_id: None,
            status: None,
            response_body: None,
            source_wallet_id: None,
            sync_attempts: 0,
            last_sync_attempt_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, update: &CircleTransferRequestUpdate) {
        if let Some(id) = &update.circle_transfer_id {
            self.circle_transfer_id = Some(id.clone());
        }
        if let Some(id) = &update.circle_payout_id {
            self.circle_payout_id = Some(id.clone());
        }
        if let Some(status) = update.status {
            self.status = Some(status);
        }
        if let Some(body) = &update.response_body {
            self.response_body = Some(body.clone());
        }
        if let Some(wallet) = &update.source_wallet_id {
            self.source_wallet_id = Some(wallet.clone());
        }
        if let Some(attempts) = update.sync_attempts {
            self.sync_attempts = attempts;
        }
        if let Some(at) = update.last_sync_attempt_at {
            self.last_sync_attempt_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            self.completed_at = Some(at);
        }
        self.updated_at = Utc::now();
    }
}

/// Columns to change on a transfer request; `None` leaves a column alone
#[derive(Debug, Clone, Default)]
pub struct CircleTransferRequestUpdate {
    /// Provider transfer id
    pub circle_transfer_id: Option<String>,
    /// Provider payout id
    pub circle_payout_id: Option<String>,
    /// Status
    pub status: Option<CircleTransferStatus>,
    /// Provider response
    pub response_body: Option<serde_json::Value>,
    /// Source wallet
    pub source_wallet_id: Option<String>,
    /// Reconciliation attempts
    pub sync_attempts: Option<u32>,
    /// Last reconciliation attempt
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

/// Address book entry created at the custodial provider for a receiver wallet
#[derive(Debug, Clone, PartialEq)]
pub struct CircleRecipient {
    /// Receiver wallet id
    pub receiver_wallet_id: String,
    /// Idempotency key of the creation request
    pub idempotency_key: String,
    /// Provider recipient id
    pub circle_recipient_id: Option<String>,
    /// Last known status
    pub status: Option<CircleRecipientStatus>,
    /// Last provider response
    pub response_body: Option<serde_json::Value>,
    /// Creation attempts so far
    pub sync_attempts: u32,
    /// Last creation attempt
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl CircleRecipient {
    /// New recipient row for a receiver wallet
    pub fn new(receiver_wallet_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            receiver_wallet_id: receiver_wallet_id.into(),
            idempotency_key: Uuid::new_v4().to_string(),
            circle_recipient_id: None,
            status: None,
            response_body: None,
            sync_attempts: 0,
            last_sync_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, update: &CircleRecipientUpdate) {
        if let Some(key) = &update.idempotency_key {
            self.idempotency_key = key.clone();
        }
        if let Some(id) = &update.circle_recipient_id {
            self.circle_recipient_id = Some(id.clone());
        }
        if let Some(status) = update.status {
            self.status = Some(status);
        }
        if let Some(body) = &update.response_body {
            self.response_body = Some(body.clone());
        }
        if let Some(attempts) = update.sync_attempts {
            self.sync_attempts = attempts;
        }
        if let Some(at) = update.last_sync_attempt_at {
            self.last_sync_attempt_at = Some(at);
        }
        self.updated_at = Utc::now();
    }
}

/// Columns to change on a recipient; `None` leaves a column alone
#[derive(Debug, Clone, Default)]
pub struct CircleRecipientUpdate {
    /// Idempotency key
    pub idempotency_key: Option<String>,
    /// Provider recipient id
    pub circle_recipient_id: Option<String>,
    /// Status
    pub status: Option<CircleRecipientStatus>,
    /// Provider response
    pub response_body: Option<serde_json::Value>,
    /// Creation attempts
    pub sync_attempts: Option<u32>,
    /// Last creation attempt
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
}

/// Tenant organization settings used when sending payments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    /// Display name
    pub name: String,
    /// Attach a tracing memo when the receiver did not ask for one
    pub memo_tracing_enabled: bool,
}

/// Payment persistence
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Payment by id
    async fn get(&self, id: &str) -> Result<Payment>;

    /// Ready payments among `ids`, with their wallets and disbursements
    async fn get_ready_by_ids(&self, ids: &[String]) -> Result<PaymentBatch>;

    /// Up to `batch_size` Ready payments of Started disbursements to Registered wallets
    async fn get_batch_for_update(&self, batch_size: usize) -> Result<PaymentBatch>;

    /// Move a payment to `status`, appending to its history
    async fn update_status(
        &self,
        id: &str,
        status: PaymentStatus,
        message: &str,
        stellar_transaction_id: Option<&str>,
    ) -> Result<Payment>;

    /// Move several payments to `status`; returns the number updated
    async fn update_statuses(&self, ids: &[String], status: PaymentStatus, message: &str) -> Result<usize>;

    /// Remember the custodial transfer or payout id of a payment
    async fn set_circle_transfer_id(&self, id: &str, transfer_id: &str) -> Result<()>;
}

/// Custodial transfer request persistence
#[async_trait]
pub trait CircleTransferRequestStore: Send + Sync {
    /// Incomplete request of a payment, or a new one
    async fn get_or_insert(&self, payment_id: &str) -> Result<CircleTransferRequest>;

    /// Incomplete request of a payment
    async fn get_incomplete_by_payment_id(&self, payment_id: &str) -> Result<Option<CircleTransferRequest>>;

    /// Apply `update` to the request with `idempotency_key`
    async fn update(
        &self,
        idempotency_key: &str,
        update: &CircleTransferRequestUpdate,
    ) -> Result<CircleTransferRequest>;

    /// Pending requests sent to the provider with fewer than `max_sync_attempts` syncs
    async fn get_pending_reconciliation(&self, max_sync_attempts: u32) -> Result<Vec<CircleTransferRequest>>;
}

/// Custodial recipient persistence
#[async_trait]
pub trait CircleRecipientStore: Send + Sync {
    /// Recipient of a receiver wallet
    async fn get_by_receiver_wallet_id(&self, receiver_wallet_id: &str) -> Result<Option<CircleRecipient>>;

    /// New recipient for a receiver wallet
    async fn insert(&self, receiver_wallet_id: &str) -> Result<CircleRecipient>;

    /// Apply `update` to the recipient of a receiver wallet
    async fn update(
        &self,
        receiver_wallet_id: &str,
        update: &CircleRecipientUpdate,
    ) -> Result<CircleRecipient>;
}

/// Organization settings
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    /// The tenant's organization
    async fn get(&self) -> Result<Organization>;
}

/// Stores of one tenant
#[derive(Clone)]
pub struct PaymentModels {
    /// Payments
    pub payments: Arc<dyn PaymentStore>,
    /// Custodial transfer requests
    pub transfer_requests: Arc<dyn CircleTransferRequestStore>,
    /// Custodial recipients
    pub recipients: Arc<dyn CircleRecipientStore>,
    /// Organization settings
    pub organizations: Arc<dyn OrganizationStore>,
}

/// Ends the database transaction shared by the stores of a `TransactionalModels`
#[async_trait]
pub trait ModelsTransaction: Send {
    /// Make every write visible and release the row locks
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write and release the row locks
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Stores of one tenant whose reads and writes run in one database transaction. Rows
/// selected for update stay locked until `commit` or `rollback`; dropping the value
/// rolls back.
pub struct TransactionalModels {
    /// The stores, bound to the transaction
    pub models: PaymentModels,
    transaction: Box<dyn ModelsTransaction>,
}

impl TransactionalModels {
    /// Bundle `models` with the transaction they run in
    pub fn new(models: PaymentModels, transaction: Box<dyn ModelsTransaction>) -> Self {
        Self {
            models,
            transaction,
        }
    }

    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        self.transaction.commit().await
    }

    /// Roll the transaction back
    pub async fn rollback(self) -> Result<()> {
        self.transaction.rollback().await
    }
}

/// Hands out the stores of a tenant
#[async_trait]
pub trait PaymentModelsProvider: Send + Sync {
    /// Stores of `tenant`, each statement in its own transaction
    async fn models_for(&self, tenant: &Tenant) -> Result<PaymentModels>;

    /// Stores of `tenant` sharing one new database transaction
    async fn begin(&self, tenant: &Tenant) -> Result<TransactionalModels>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_transfer_status() {
        assert_eq!(CircleTransferStatus::from_str("complete").unwrap(), CircleTransferStatus::Success);
        assert!(CircleTransferStatus::Failed.is_completed());
        assert!(!CircleTransferStatus::Pending.is_completed());
        assert!(CircleTransferStatus::from_str("running").is_err());
    }

    #[test]
    fn test_recipient_key_renewal() {
        assert!(CircleRecipientStatus::Denied.needs_new_idempotency_key());
        assert!(CircleRecipientStatus::Inactive.needs_new_idempotency_key());
        assert!(!CircleRecipientStatus::Pending.needs_new_idempotency_key());
        assert!(!CircleRecipientStatus::Active.needs_new_idempotency_key());
    }

    #[test]
    fn test_update_leaves_unset_columns() {
        let mut request = CircleTransferRequest::new("p1");
        let key = request.idempotency_key.clone();
        request.apply(&CircleTransferRequestUpdate {
            circle_transfer_id: Some("t1".to_string()),
            status: Some(CircleTransferStatus::Pending),
            ..Default::default()
        });
        request.apply(&CircleTransferRequestUpdate {
            sync_attempts: Some(1),
            ..Default::default()
        });

        assert_eq!(request.idempotency_key, key);
        assert_eq!(request.circle_transfer_id.as_deref(), Some("t1"));
        assert_eq!(request.status, Some(CircleTransferStatus::Pending));
        assert_eq!(request.sync_attempts, 1);
        assert!(request.completed_at.is_none());
    }
}
