//! Signature service assembly

use crate::client::{AccountEnvSignatureClient, DbVaultSignatureClient, SignatureClient};
use crate::encryption::{AesGcmEncrypter, PrivateKeyEncrypter};
use crate::router::SignerRouter;
use crate::store::SignerKeyStore;
use crate::{Result, SigningError};
use disbursement_core::{
    AccountType, DistributionAccountResolver, TenantDistributionAccountResolver,
    TransactionAccount,
};
use std::sync::Arc;
use tracing::info;

/// Where distribution account keys are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionSignerType {
    /// One distribution secret from the environment
    Env,
    /// Encrypted per-tenant keys in the database vault
    DbVault,
}

impl DistributionSignerType {
    /// Account type signed by this signer
    pub fn account_type(&self) -> AccountType {
        match self {
            DistributionSignerType::Env => AccountType::DistributionAccountStellarEnv,
            DistributionSignerType::DbVault => AccountType::DistributionAccountStellarDbVault,
        }
    }
}

/// Everything needed to build a `SignatureService`
pub struct SignatureServiceOptions {
    /// Network passphrase
    pub network_passphrase: String,
    /// Host account secret
    pub host_account_secret: String,
    /// Distribution secret, required for `DistributionSignerType::Env`
    pub distribution_account_secret: Option<String>,
    /// Distribution signer
    pub distribution_signer_type: DistributionSignerType,
    /// Passphrase protecting database-stored keys
    pub encryption_passphrase: String,
    /// Channel account key store
    pub channel_account_store: Arc<dyn SignerKeyStore>,
    /// Distribution vault key store, required for `DistributionSignerType::DbVault`
    pub distribution_vault_store: Option<Arc<dyn SignerKeyStore>>,
}

/// Signer router plus the accounts it signs for
pub struct SignatureService {
    router: Arc<SignerRouter>,
    distribution_resolver: Arc<dyn DistributionAccountResolver>,
    host_account: TransactionAccount,
    distribution_signer_type: DistributionSignerType,
}

impl SignatureService {
    /// Build the clients and the router
    pub fn new(options: SignatureServiceOptions) -> Result<Self> {
        let passphrase = options.network_passphrase.as_str();
        let encrypter: Arc<dyn PrivateKeyEncrypter> =
            Arc::new(AesGcmEncrypter::new(&options.encryption_passphrase)?);

        let host = AccountEnvSignatureClient::new(
            &options.host_account_secret,
            AccountType::HostStellarEnv,
            passphrase,
        )?;
        let host_account = TransactionAccount::host(host.address());

        let channel = DbVaultSignatureClient::new(
            options.channel_account_store.clone(),
            encrypter.clone(),
            AccountType::ChannelAccountStellarDb,
            passphrase,
        );

        let distribution: Arc<dyn SignatureClient> = match options.distribution_signer_type {
            DistributionSignerType::Env => {
                let secret = options.distribution_account_secret.as_deref().ok_or(
                    SigningError::Configuration(
                        "distribution account secret is required".to_string(),
                    ),
                )?;
                Arc::new(AccountEnvSignatureClient::new(
                    secret,
                    AccountType::DistributionAccountStellarEnv,
                    passphrase,
                )?)
            }
            DistributionSignerType::DbVault => {
                let store = options.distribution_vault_store.clone().ok_or(
                    SigningError::Configuration(
                        "distribution vault store is required".to_string(),
                    ),
                )?;
                Arc::new(DbVaultSignatureClient::new(
                    store,
                    encrypter.clone(),
                    AccountType::DistributionAccountStellarDbVault,
                    passphrase,
                ))
            }
        };

        let clients: Vec<Arc<dyn SignatureClient>> =
            vec![Arc::new(host), Arc::new(channel), distribution];
        let router = SignerRouter::new(clients)?;

        info!(
            host = %host_account.address,
            distribution_signer = ?options.distribution_signer_type,
            "Signature service ready"
        );

        Ok(Self {
            router: Arc::new(router),
            distribution_resolver: Arc::new(TenantDistributionAccountResolver::new(
                host_account.address.clone(),
            )),
            host_account,
            distribution_signer_type: options.distribution_signer_type,
        })
    }

    /// Signer router
    pub fn router(&self) -> &Arc<SignerRouter> {
        &self.router
    }

    /// Distribution account resolver
    pub fn distribution_resolver(&self) -> &Arc<dyn DistributionAccountResolver> {
        &self.distribution_resolver
    }

    /// Host account
    pub fn host_account(&self) -> &TransactionAccount {
        &self.host_account
    }

    /// Distribution signer in use
    pub fn distribution_signer_type(&self) -> DistributionSignerType {
        self.distribution_signer_type
    }

    /// Network passphrase
    pub fn network_passphrase(&self) -> &str {
        self.router.network_passphrase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySignerKeyStore;
    use ledger_client::KeyPair;

    fn options(signer: DistributionSignerType) -> SignatureServiceOptions {
        SignatureServiceOptions {
            network_passphrase: "Test SDF Network ; September 2015".to_string(),
            host_account_secret: KeyPair::generate().secret(),
            distribution_account_secret: Some(KeyPair::generate().secret()),
            distribution_signer_type: signer,
            encryption_passphrase: "encryption".to_string(),
            channel_account_store: Arc::new(InMemorySignerKeyStore::new()),
            distribution_vault_store: Some(Arc::new(InMemorySignerKeyStore::new())),
        }
    }

    #[test]
    fn test_builds_router_for_all_roles() {
        let service = SignatureService::new(options(DistributionSignerType::DbVault)).unwrap();
        let types = service.router().supported_account_types();

        assert!(types.contains(&AccountType::HostStellarEnv));
        assert!(types.contains(&AccountType::ChannelAccountStellarDb));
        assert!(types.contains(&AccountType::DistributionAccountStellarDbVault));
        assert!(!types.contains(&AccountType::DistributionAccountCircleDbVault));
    }

    #[test]
    fn test_env_distribution_requires_secret() {
        let mut opts = options(DistributionSignerType::Env);
        opts.distribution_account_secret = None;
        assert!(SignatureService::new(opts).is_err());
    }
}
