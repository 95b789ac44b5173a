//! Signature clients, one per account type

use crate::encryption::PrivateKeyEncrypter;
use crate::store::{SignerKeyStore, StoredSigner};
use crate::{Result, SigningError};
use async_trait::async_trait;
use chrono::Utc;
use disbursement_core::{AccountType, TransactionAccount};
use ledger_client::{DecoratedSignature, KeyPair};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Signs on behalf of the accounts of one account type
#[async_trait]
pub trait SignatureClient: Send + Sync {
    /// Network the client signs for
    fn network_passphrase(&self) -> &str;

    /// Account type served by this client
    fn account_type(&self) -> AccountType;

    /// Sign a transaction hash with every account in `accounts`
    async fn sign_hash(
        &self,
        hash: &[u8; 32],
        accounts: &[TransactionAccount],
    ) -> Result<Vec<DecoratedSignature>>;

    /// Create `number` new accounts and store their keys
    async fn batch_insert(&self, number: usize) -> Result<Vec<TransactionAccount>>;

    /// Remove the stored key of an account
    async fn delete(&self, account: &TransactionAccount) -> Result<()>;
}

fn distinct_addresses(accounts: &[TransactionAccount]) -> BTreeSet<&str> {
    accounts.iter().map(|a| a.address.as_str()).collect()
}

/// Client for an account whose secret comes from the environment
pub struct AccountEnvSignatureClient {
    keypair: KeyPair,
    account_type: AccountType,
    network_passphrase: String,
}

impl AccountEnvSignatureClient {
    /// Create from a hex secret
    pub fn new(
        secret: &str,
        account_type: AccountType,
        network_passphrase: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            keypair: KeyPair::from_secret(secret)?,
            account_type,
            network_passphrase: network_passphrase.into(),
        })
    }

    /// Address of the account
    pub fn address(&self) -> String {
        self.keypair.address()
    }
}

#[async_trait]
impl SignatureClient for AccountEnvSignatureClient {
    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    fn account_type(&self) -> AccountType {
        self.account_type
    }

    async fn sign_hash(
        &self,
        hash: &[u8; 32],
        accounts: &[TransactionAccount],
    ) -> Result<Vec<DecoratedSignature>> {
        let own_address = self.keypair.address();
        let addresses = distinct_addresses(accounts);
        if let Some(unknown) = addresses.iter().find(|a| **a != own_address) {
            return Err(SigningError::AccountNotFound(unknown.to_string()));
        }
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![DecoratedSignature::sign(&self.keypair, hash)])
    }

    async fn batch_insert(&self, _number: usize) -> Result<Vec<TransactionAccount>> {
        Err(SigningError::Unsupported {
            operation: "batch insert",
            account_type: self.account_type,
        })
    }

    async fn delete(&self, _account: &TransactionAccount) -> Result<()> {
        Err(SigningError::Unsupported {
            operation: "delete",
            account_type: self.account_type,
        })
    }
}

/// Client for accounts whose encrypted secrets live in the database
pub struct DbVaultSignatureClient {
    store: Arc<dyn SignerKeyStore>,
    encrypter: Arc<dyn PrivateKeyEncrypter>,
    account_type: AccountType,
    network_passphrase: String,
}

impl DbVaultSignatureClient {
    /// Create a client over a key store
    pub fn new(
        store: Arc<dyn SignerKeyStore>,
        encrypter: Arc<dyn PrivateKeyEncrypter>,
        account_type: AccountType,
        network_passphrase: impl Into<String>,
    ) -> Self {
        Self {
            store,
            encrypter,
            account_type,
            network_passphrase: network_passphrase.into(),
        }
    }

    async fn sign_with(&self, address: &str, hash: &[u8; 32]) -> Result<DecoratedSignature> {
        let stored = self.store.get(address).await?;
        // The decrypted key only lives for this call.
        let keypair = KeyPair::from_secret(&self.encrypter.decrypt(&stored.encrypted_private_key)?)?;
        if keypair.address() != address {
            return Err(SigningError::Encryption(format!(
                "stored key does not match account {}",
                address
            )));
        }
        Ok(DecoratedSignature::sign(&keypair, hash))
    }
}

#[async_trait]
impl SignatureClient for DbVaultSignatureClient {
    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    fn account_type(&self) -> AccountType {
        self.account_type
    }

    async fn sign_hash(
        &self,
        hash: &[u8; 32],
        accounts: &[TransactionAccount],
    ) -> Result<Vec<DecoratedSignature>> {
        let mut signatures = Vec::with_capacity(accounts.len());
        for address in distinct_addresses(accounts) {
            signatures.push(self.sign_with(address, hash).await?);
        }
        debug!(
            account_type = %self.account_type,
            signatures = signatures.len(),
            "Signed transaction hash"
        );
        Ok(signatures)
    }

    async fn batch_insert(&self, number: usize) -> Result<Vec<TransactionAccount>> {
        if number == 0 {
            return Err(SigningError::InvalidBatchSize(number));
        }

        let now = Utc::now();
        let mut signers = Vec::with_capacity(number);
        let mut accounts = Vec::with_capacity(number);
        for _ in 0..number {
            let keypair = KeyPair::generate();
            signers.push(StoredSigner {
                public_key: keypair.address(),
                encrypted_private_key: self.encrypter.encrypt(&keypair.secret())?,
                created_at: now,
            });
            accounts.push(TransactionAccount::stellar(
                keypair.address(),
                self.account_type,
            ));
        }

        self.store.batch_insert(&signers).await?;
        info!(account_type = %self.account_type, number, "Stored new signing keys");
        Ok(accounts)
    }

    async fn delete(&self, account: &TransactionAccount) -> Result<()> {
        self.store.delete(&account.address).await?;
        info!(account_type = %self.account_type, address = %account.address, "Deleted signing key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::AesGcmEncrypter;
    use crate::store::InMemorySignerKeyStore;

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    fn vault_client() -> (DbVaultSignatureClient, Arc<InMemorySignerKeyStore>) {
        let store = Arc::new(InMemorySignerKeyStore::new());
        let client = DbVaultSignatureClient::new(
            store.clone(),
            Arc::new(AesGcmEncrypter::new("vault-passphrase").unwrap()),
            AccountType::ChannelAccountStellarDb,
            PASSPHRASE,
        );
        (client, store)
    }

    #[tokio::test]
    async fn test_env_client_signs_only_its_account() {
        let keypair = KeyPair::generate();
        let client =
            AccountEnvSignatureClient::new(&keypair.secret(), AccountType::HostStellarEnv, PASSPHRASE)
                .unwrap();
        let hash = [9u8; 32];

        let signatures = client
            .sign_hash(&hash, &[TransactionAccount::host(keypair.address())])
            .await
            .unwrap();
        assert_eq!(signatures.len(), 1);
        assert!(signatures[0].verify(&hash));

        let other = TransactionAccount::host(KeyPair::generate().address());
        assert!(matches!(
            client.sign_hash(&hash, &[other]).await,
            Err(SigningError::AccountNotFound(_))
        ));
        assert!(matches!(
            client.batch_insert(1).await,
            Err(SigningError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_vault_client_inserts_signs_and_deletes() {
        let (client, store) = vault_client();

        let accounts = client.batch_insert(3).await.unwrap();
        assert_eq!(accounts.len(), 3);
        assert_eq!(store.count().await.unwrap(), 3);

        let stored = store.get(&accounts[0].address).await.unwrap();
        assert_ne!(stored.encrypted_private_key.len(), 64);

        let hash = [1u8; 32];
        let signatures = client.sign_hash(&hash, &accounts).await.unwrap();
        assert_eq!(signatures.len(), 3);
        assert!(signatures.iter().all(|s| s.verify(&hash)));

        client.delete(&accounts[0]).await.unwrap();
        assert!(matches!(
            client.sign_hash(&hash, &accounts[..1]).await,
            Err(SigningError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_vault_client_rejects_empty_batch() {
        let (client, _) = vault_client();
        assert!(matches!(
            client.batch_insert(0).await,
            Err(SigningError::InvalidBatchSize(0))
        ));
    }
}
