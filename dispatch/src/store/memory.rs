//! Stores held in memory

use super::{
    CircleRecipient, CircleRecipientStore, CircleRecipientUpdate, CircleTransferRequest,
    CircleTransferRequestStore, CircleTransferRequestUpdate, CircleTransferStatus, Organization,
    ModelsTransaction, OrganizationStore, PaymentModels, PaymentModelsProvider, PaymentStore,
    TransactionalModels,
};
use crate::{DispatchError, Result};
use async_trait::async_trait;
use disbursement_core::{
    Disbursement, DisbursementStatus, Payment, PaymentBatch, PaymentStatus, ReceiverWallet,
    ReceiverWalletStatus, Tenant,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Payments, receiver wallets and disbursements held in memory
#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: RwLock<HashMap<String, Payment>>,
    receiver_wallets: RwLock<HashMap<String, ReceiverWallet>>,
    disbursements: RwLock<HashMap<String, Disbursement>>,
}

impl InMemoryPaymentStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a payment together with the records it references
    pub fn insert(&self, payment: Payment, wallet: ReceiverWallet, disbursement: Disbursement) {
        self.receiver_wallets.write().insert(wallet.id.clone(), wallet);
        self.disbursements
            .write()
            .insert(disbursement.id.clone(), disbursement);
        self.payments.write().insert(payment.id.clone(), payment);
    }

    /// Replace a receiver wallet
    pub fn upsert_receiver_wallet(&self, wallet: ReceiverWallet) {
        self.receiver_wallets.write().insert(wallet.id.clone(), wallet);
    }

    /// Payment by id, without going through the trait
    pub fn payment(&self, id: &str) -> Option<Payment> {
        self.payments.read().get(id).cloned()
    }

    fn batch_where<F>(&self, limit: usize, mut include: F) -> PaymentBatch
    where
        F: FnMut(&Payment, &ReceiverWallet, &Disbursement) -> bool,
    {
        let payments = self.payments.read();
        let wallets = self.receiver_wallets.read();
        let disbursements = self.disbursements.read();

        let mut ordered: Vec<&Payment> = payments.values().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut batch = PaymentBatch::new();
        for payment in ordered {
            if batch.len() >= limit {
                break;
            }
            let (Some(wallet), Some(disbursement)) = (
                wallets.get(&payment.receiver_wallet_id),
                disbursements.get(&payment.disbursement_id),
            ) else {
                continue;
            };
            if include(payment, wallet, disbursement) {
                batch.push(payment.clone(), wallet.clone(), disbursement.clone());
            }
        }
        batch
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn get(&self, id: &str) -> Result<Payment> {
        self.payment(id)
            .ok_or_else(|| DispatchError::NotFound(format!("payment {}", id)))
    }

    async fn get_ready_by_ids(&self, ids: &[String]) -> Result<PaymentBatch> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self.batch_where(usize::MAX, |payment, _, _| {
            wanted.contains(payment.id.as_str()) && payment.status == PaymentStatus::Ready
        }))
    }

    async fn get_batch_for_update(&self, batch_size: usize) -> Result<PaymentBatch> {
        Ok(self.batch_where(batch_size, |payment, wallet, disbursement| {
            payment.status == PaymentStatus::Ready
                && wallet.status == ReceiverWalletStatus::Registered
                && disbursement.status == DisbursementStatus::Started
        }))
    }

    async fn update_status(
        &self,
        id: &str,
        status: PaymentStatus,
        message: &str,
        stellar_transaction_id: Option<&str>,
    ) -> Result<Payment> {
        let mut payments = self.payments.write();
        let payment = payments
            .get_mut(id)
            .ok_or_else(|| DispatchError::NotFound(format!("payment {}", id)))?;
        payment.transition(status, message);
        if let Some(hash) = stellar_transaction_id.filter(|h| !h.is_empty()) {
            payment.stellar_transaction_id = Some(hash.to_string());
        }
        Ok(payment.clone())
    }

    async fn update_statuses(&self, ids: &[String], status: PaymentStatus, message: &str) -> Result<usize> {
        let mut payments = self.payments.write();
        let mut updated = 0;
        for id in ids {
            if let Some(payment) = payments.get_mut(id) {
                payment.transition(status, message);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn set_circle_transfer_id(&self, id: &str, transfer_id: &str) -> Result<()> {
        let mut payments = self.payments.write();
        let payment = payments
            .get_mut(id)
            .ok_or_else(|| DispatchError::NotFound(format!("payment {}", id)))?;
        payment.circle_transfer_id = Some(transfer_id.to_string());
        Ok(())
    }
}

/// Custodial transfer requests held in memory
#[derive(Default)]
pub struct InMemoryCircleTransferRequestStore {
    requests: RwLock<Vec<CircleTransferRequest>>,
}

impl InMemoryCircleTransferRequestStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request of a payment, oldest first
    pub fn list_by_payment_id(&self, payment_id: &str) -> Vec<CircleTransferRequest> {
        self.requests
            .read()
            .iter()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CircleTransferRequestStore for InMemoryCircleTransferRequestStore {
    async fn get_or_insert(&self, payment_id: &str) -> Result<CircleTransferRequest> {
        let mut requests = self.requests.write();
        if let Some(existing) = requests
            .iter()
            .find(|r| r.payment_id == payment_id && r.completed_at.is_none())
        {
            return Ok(existing.clone());
        }
        let request = CircleTransferRequest::new(payment_id);
        requests.push(request.clone());
        Ok(request)
    }

    async fn get_incomplete_by_payment_id(&self, payment_id: &str) -> Result<Option<CircleTransferRequest>> {
        Ok(self
            .requests
            .read()
            .iter()
            .find(|r| r.payment_id == payment_id && r.completed_at.is_none())
            .cloned())
    }

    async fn update(
        &self,
        idempotency_key: &str,
        update: &CircleTransferRequestUpdate,
    ) -> Result<CircleTransferRequest> {
        let mut requests = self.requests.write();
        let request = requests
            .iter_mut()
            .find(|r| r.idempotency_key == idempotency_key)
            .ok_or_else(|| {
                DispatchError::NotFound(format!("circle transfer request {}", idempotency_key))
            })?;
        request.apply(update);
        Ok(request.clone())
    }

    async fn get_pending_reconciliation(&self, max_sync_attempts: u32) -> Result<Vec<CircleTransferRequest>> {
        Ok(self
            .requests
            .read()
            .iter()
            .filter(|r| {
                r.status == Some(CircleTransferStatus::Pending)
                    && r.sync_attempts < max_sync_attempts
                    && (r.circle_transfer_id.is_some() || r.circle_payout_id.is_some())
            })
            .cloned()
            .collect())
    }
}

/// Custodial recipients held in memory
#[derive(Default)]
pub struct InMemoryCircleRecipientStore {
    recipients: RwLock<HashMap<String, CircleRecipient>>,
}

impl InMemoryCircleRecipientStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircleRecipientStore for InMemoryCircleRecipientStore {
    async fn get_by_receiver_wallet_id(&self, receiver_wallet_id: &str) -> Result<Option<CircleRecipient>> {
        Ok(self.recipients.read().get(receiver_wallet_id).cloned())
    }

    async fn insert(&self, receiver_wallet_id: &str) -> Result<CircleRecipient> {
        let mut recipients = self.recipients.write();
        if recipients.contains_key(receiver_wallet_id) {
            return Err(DispatchError::InvalidRequest(format!(
                "circle recipient for receiver wallet {} already exists",
                receiver_wallet_id
            )));
        }
        let recipient = CircleRecipient::new(receiver_wallet_id);
        recipients.insert(receiver_wallet_id.to_string(), recipient.clone());
        Ok(recipient)
    }

    async fn update(
        &self,
        receiver_wallet_id: &str,
        update: &CircleRecipientUpdate,
    ) -> Result<CircleRecipient> {
        let mut recipients = self.recipients.write();
        let recipient = recipients.get_mut(receiver_wallet_id).ok_or_else(|| {
            DispatchError::NotFound(format!("circle recipient for receiver wallet {}", receiver_wallet_id))
        })?;
        recipient.apply(update);
        Ok(recipient.clone())
    }
}

/// Organization settings held in memory
pub struct InMemoryOrganizationStore {
    organization: RwLock<Organization>,
}

impl InMemoryOrganizationStore {
    /// Organization named `name`, memo tracing off
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            organization: RwLock::new(Organization {
                name: name.into(),
                memo_tracing_enabled: false,
            }),
        }
    }

    /// Toggle memo tracing
    pub fn set_memo_tracing(&self, enabled: bool) {
        self.organization.write().memo_tracing_enabled = enabled;
    }
}

#[async_trait]
impl OrganizationStore for InMemoryOrganizationStore {
    async fn get(&self) -> Result<Organization> {
        Ok(self.organization.read().clone())
    }
}

/// In-memory stores of one tenant, keeping the concrete handles around
#[derive(Clone)]
pub struct InMemoryStores {
    /// Payments
    pub payments: Arc<InMemoryPaymentStore>,
    /// Custodial transfer requests
    pub transfer_requests: Arc<InMemoryCircleTransferRequestStore>,
    /// Custodial recipients
    pub recipients: Arc<InMemoryCircleRecipientStore>,
    /// Organization settings
    pub organizations: Arc<InMemoryOrganizationStore>,
}

impl InMemoryStores {
    /// Empty stores for an organization named `organization_name`
    pub fn new(organization_name: impl Into<String>) -> Self {
        Self {
            payments: Arc::new(InMemoryPaymentStore::new()),
            transfer_requests: Arc::new(InMemoryCircleTransferRequestStore::new()),
            recipients: Arc::new(InMemoryCircleRecipientStore::new()),
            organizations: Arc::new(InMemoryOrganizationStore::new(organization_name)),
        }
    }

    /// The stores behind their traits
    pub fn models(&self) -> PaymentModels {
        PaymentModels {
            payments: self.payments.clone(),
            transfer_requests: self.transfer_requests.clone(),
            recipients: self.recipients.clone(),
            organizations: self.organizations.clone(),
        }
    }
}

/// Provider over a fixed set of in-memory tenants. Writes apply immediately; a unit
/// opened with `begin` only holds the tenant lock, so concurrent units run one at a time.
#[derive(Default)]
pub struct InMemoryPaymentModelsProvider {
    models: RwLock<HashMap<String, PaymentModels>>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryPaymentModelsProvider {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the stores of a tenant
    pub fn insert(&self, tenant_id: impl Into<String>, models: PaymentModels) {
        let tenant_id = tenant_id.into();
        self.locks.write().entry(tenant_id.clone()).or_default();
        self.models.write().insert(tenant_id, models);
    }

    fn lock_of(&self, tenant: &Tenant) -> Result<Arc<Mutex<()>>> {
        self.locks
            .read()
            .get(&tenant.id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("payment models for tenant {}", tenant.id)))
    }
}

/// Tenant lock held by an open in-memory unit
struct InMemoryModelsTransaction {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl ModelsTransaction for InMemoryModelsTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PaymentModelsProvider for InMemoryPaymentModelsProvider {
    async fn models_for(&self, tenant: &Tenant) -> Result<PaymentModels> {
        self.models
            .read()
            .get(&tenant.id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("payment models for tenant {}", tenant.id)))
    }

    async fn begin(&self, tenant: &Tenant) -> Result<TransactionalModels> {
        let guard = self.lock_of(tenant)?.lock_owned().await;
        let models = self.models_for(tenant).await?;
        Ok(TransactionalModels::new(
            models,
            Box::new(InMemoryModelsTransaction { _guard: guard }),
        ))
    }
}
