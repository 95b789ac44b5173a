#![allow(dead_code)]

use disbursement_core::{
    AccountStatus, AccountType, Asset, Disbursement, DisbursementStatus, InMemoryTenantManager,
    Payment, ReceiverWallet, RetryPolicy, Tenant, TenantDistributionAccountResolver,
};
use dispatch::{
    CircleApiType, CirclePaymentDispatcher, CircleReconciliationService,
    InMemoryPaymentModelsProvider, InMemoryStores, MockCustodialClient, PaymentToSubmitterService,
    StellarPaymentDispatcher,
};
use std::sync::Arc;
use std::time::Duration;
use submission::InMemorySubmitterTransactionStore;

pub const STELLAR_TENANT: &str = "tenant-stellar";
pub const CIRCLE_TENANT: &str = "tenant-circle";
pub const CIRCLE_WALLET: &str = "custodial-wallet-1";

pub struct Harness {
    pub tenants: Arc<InMemoryTenantManager>,
    pub resolver: Arc<TenantDistributionAccountResolver>,
    pub provider: Arc<InMemoryPaymentModelsProvider>,
    pub stellar: InMemoryStores,
    pub circle: InMemoryStores,
    pub submitter: Arc<InMemorySubmitterTransactionStore>,
    pub custodial: Arc<MockCustodialClient>,
}

impl Harness {
    pub fn new() -> Self {
        let tenants = Arc::new(InMemoryTenantManager::new("postgres://localhost/sdp"));
        tenants.upsert(
            Tenant::new(STELLAR_TENANT, "bluecorp")
                .with_stellar_distribution("GDISTRIBUTION", AccountType::DistributionAccountStellarDbVault),
        );
        tenants.upsert(
            Tenant::new(CIRCLE_TENANT, "redcorp")
                .with_circle_distribution(Some(CIRCLE_WALLET.to_string()), AccountStatus::Active),
        );

        let stellar = InMemoryStores::new("Blue Corp");
        let circle = InMemoryStores::new("Red Corp");
        let provider = Arc::new(InMemoryPaymentModelsProvider::new());
        provider.insert(STELLAR_TENANT, stellar.models());
        provider.insert(CIRCLE_TENANT, circle.models());

        Self {
            tenants,
            resolver: Arc::new(TenantDistributionAccountResolver::new("GHOST")),
            provider,
            stellar,
            circle,
            submitter: Arc::new(InMemorySubmitterTransactionStore::new()),
            custodial: Arc::new(MockCustodialClient::new()),
        }
    }

    pub fn service(&self, api_type: CircleApiType) -> PaymentToSubmitterService {
        let stellar = StellarPaymentDispatcher::new(self.resolver.clone(), self.submitter.clone());
        let circle = CirclePaymentDispatcher::new(self.resolver.clone(), self.custodial.clone(), api_type)
            .with_recipient_retry(fast_retry());

        PaymentToSubmitterService::new(
            self.tenants.clone(),
            self.resolver.clone(),
            self.provider.clone(),
            vec![stellar.into(), circle.into()],
        )
    }

    pub fn reconciliation(&self) -> CircleReconciliationService {
        CircleReconciliationService::new(self.resolver.clone(), self.custodial.clone())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::custodial_recipient().with_delays(Duration::from_millis(1), Duration::from_millis(2))
}

pub fn started_disbursement() -> Disbursement {
    Disbursement {
        id: "d1".to_string(),
        name: "May payroll".to_string(),
        status: DisbursementStatus::Started,
    }
}

pub fn add_payment(stores: &InMemoryStores, id: &str, amount: &str, wallet: ReceiverWallet) {
    let asset = Asset::new("USDC", "GISSUER");
    stores.payments.insert(
        Payment::new(id, amount, asset, wallet.id.clone(), "d1"),
        wallet,
        started_disbursement(),
    );
}

pub fn wallet(id: &str) -> ReceiverWallet {
    ReceiverWallet::registered(id, format!("receiver-{}", id), format!("GADDR{}", id.to_uppercase()))
}
