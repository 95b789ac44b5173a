#![allow(dead_code)]

use async_trait::async_trait;
use disbursement_core::{AccountType, InMemoryTenantManager, Tenant};
use ledger_client::{Asset, KeyPair, MockLedger};
use rust_decimal::Decimal;
use signing::{
    DistributionSignerType, InMemorySignerKeyStore, SignatureService, SignatureServiceOptions,
    SignerKeyStore, SigningError, StoredSigner,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use submission::{
    ChannelAccountManager, ChannelAccountPool, InMemorySubmitterTransactionStore,
    NewSubmitterTransaction, SubmitterConfig,
};

pub const PASSPHRASE: &str = "Test SDF Network ; September 2015";
pub const TENANT_ID: &str = "tenant-1";

pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub host: KeyPair,
    pub signatures: Arc<SignatureService>,
    pub channel_store: Arc<ChannelKeyStore>,
    pub tenants: Arc<InMemoryTenantManager>,
    pub store: Arc<InMemorySubmitterTransactionStore>,
    pub pool: Arc<ChannelAccountPool>,
    pub distribution: String,
    pub usdc: Asset,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_ledger(MockLedger::new(PASSPHRASE)).await
    }

    pub async fn with_ledger(ledger: MockLedger) -> Self {
        let ledger = Arc::new(ledger);
        let host = KeyPair::generate();
        ledger.create_account(&host.address(), Decimal::from(10_000));

        let channel_store = Arc::new(ChannelKeyStore::default());
        let signatures = Arc::new(
            SignatureService::new(SignatureServiceOptions {
                network_passphrase: PASSPHRASE.to_string(),
                host_account_secret: host.secret(),
                distribution_account_secret: None,
                distribution_signer_type: DistributionSignerType::DbVault,
                encryption_passphrase: "test-encryption-passphrase".to_string(),
                channel_account_store: channel_store.clone(),
                distribution_vault_store: Some(Arc::new(InMemorySignerKeyStore::new())),
            })
            .unwrap(),
        );

        let distribution = signatures
            .router()
            .batch_insert(AccountType::DistributionAccountStellarDbVault, 1)
            .await
            .unwrap()
            .remove(0)
            .address;
        let usdc = Asset::credit("USDC", KeyPair::generate().address());
        ledger.create_account(&distribution, Decimal::from(1_000));
        ledger.credit(&distribution, &usdc, Decimal::from(10_000));

        let tenants = Arc::new(InMemoryTenantManager::new("postgres://localhost/sdp"));
        tenants.upsert(
            Tenant::new(TENANT_ID, "bluecorp")
                .with_stellar_distribution(&distribution, AccountType::DistributionAccountStellarDbVault),
        );

        Self {
            ledger,
            host,
            signatures,
            channel_store,
            tenants,
            store: Arc::new(InMemorySubmitterTransactionStore::new()),
            pool: ChannelAccountPool::new(),
            distribution,
            usdc,
        }
    }

    pub fn manager(&self) -> ChannelAccountManager {
        ChannelAccountManager::new(
            self.ledger.clone(),
            self.signatures.clone(),
            self.channel_store.clone(),
            self.pool.clone(),
        )
    }

    pub async fn with_channel_accounts(self, number: usize) -> Self {
        self.manager()
            .create_channel_accounts(number)
            .await
            .unwrap();
        self
    }

    /// Receiver account that exists on the ledger
    pub fn receiver(&self) -> String {
        let address = KeyPair::generate().address();
        self.ledger.create_account(&address, Decimal::from(2));
        address
    }

    pub fn payment(&self, payment_id: &str, destination: &str, amount: Decimal) -> NewSubmitterTransaction {
        NewSubmitterTransaction {
            external_id: payment_id.to_string(),
            tenant_id: TENANT_ID.to_string(),
            asset_code: self.usdc.code.clone(),
            asset_issuer: self.usdc.issuer.clone().unwrap_or_default(),
            amount,
            destination: destination.to_string(),
            memo: None,
            memo_type: None,
        }
    }
}

pub fn fast_config() -> SubmitterConfig {
    SubmitterConfig {
        poll_interval: Duration::from_millis(10),
        retry_policy: disbursement_core::RetryPolicy::submission()
            .without_jitter()
            .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        ..Default::default()
    }
}

/// In-memory channel account keys whose deletes can be made to fail
#[derive(Default)]
pub struct ChannelKeyStore {
    inner: InMemorySignerKeyStore,
    fail_deletes: AtomicBool,
}

impl ChannelKeyStore {
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignerKeyStore for ChannelKeyStore {
    async fn batch_insert(&self, signers: &[StoredSigner]) -> signing::Result<()> {
        self.inner.batch_insert(signers).await
    }

    async fn get(&self, public_key: &str) -> signing::Result<StoredSigner> {
        self.inner.get(public_key).await
    }

    async fn delete(&self, public_key: &str) -> signing::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SigningError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.delete(public_key).await
    }

    async fn list(&self) -> signing::Result<Vec<StoredSigner>> {
        self.inner.list().await
    }

    async fn count(&self) -> signing::Result<usize> {
        self.inner.count().await
    }
}
