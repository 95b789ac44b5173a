//! Routes signing requests to the client registered for each account type

use crate::client::SignatureClient;
use crate::{Result, SigningError};
use disbursement_core::{AccountType, TransactionAccount};
use ledger_client::{
    FeeBumpTransaction, SignedFeeBumpTransaction, SignedTransaction, Transaction,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Signer router
pub struct SignerRouter {
    clients: BTreeMap<AccountType, Arc<dyn SignatureClient>>,
    network_passphrase: String,
}

impl SignerRouter {
    /// Build a router; every client must sign for the same network
    pub fn new(clients: Vec<Arc<dyn SignatureClient>>) -> Result<Self> {
        let network_passphrase = clients
            .first()
            .map(|c| c.network_passphrase().to_string())
            .ok_or(SigningError::NoClients)?;

        let mut by_type = BTreeMap::new();
        for client in clients {
            if client.network_passphrase() != network_passphrase {
                return Err(SigningError::NetworkPassphraseMismatch {
                    expected: network_passphrase,
                    found: client.network_passphrase().to_string(),
                });
            }
            by_type.insert(client.account_type(), client);
        }

        Ok(Self {
            clients: by_type,
            network_passphrase,
        })
    }

    /// Network every client signs for
    pub fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    /// Account types with a registered client
    pub fn supported_account_types(&self) -> Vec<AccountType> {
        self.clients.keys().copied().collect()
    }

    fn client_for(&self, account_type: AccountType) -> Result<&Arc<dyn SignatureClient>> {
        self.clients
            .get(&account_type)
            .ok_or(SigningError::NoClientForAccountType(account_type))
    }

    async fn sign_hash(
        &self,
        hash: &[u8; 32],
        accounts: &[TransactionAccount],
    ) -> Result<Vec<ledger_client::DecoratedSignature>> {
        if accounts.is_empty() {
            return Err(SigningError::NoAccountsProvided);
        }

        let mut by_type: BTreeMap<AccountType, Vec<TransactionAccount>> = BTreeMap::new();
        for account in accounts {
            by_type
                .entry(account.account_type)
                .or_default()
                .push(account.clone());
        }

        // Resolve every client first so a missing one fails before any key is touched.
        let mut plan = Vec::with_capacity(by_type.len());
        for (account_type, group) in by_type {
            plan.push((self.client_for(account_type)?, group));
        }

        let mut signatures = Vec::with_capacity(accounts.len());
        for (client, group) in plan {
            signatures.extend(client.sign_hash(hash, &group).await?);
        }
        Ok(signatures)
    }

    /// Sign a transaction with every account in `accounts`
    pub async fn sign_stellar_transaction(
        &self,
        transaction: Transaction,
        accounts: &[TransactionAccount],
    ) -> Result<SignedTransaction> {
        let hash = transaction.hash(&self.network_passphrase)?;
        let signatures = self.sign_hash(&hash, accounts).await?;

        debug!(
            source = %transaction.source_account,
            signatures = signatures.len(),
            "Signed transaction"
        );
        Ok(SignedTransaction {
            transaction,
            signatures,
        })
    }

    /// Sign a fee bump with its fee source
    pub async fn sign_fee_bump_stellar_transaction(
        &self,
        fee_bump: FeeBumpTransaction,
        accounts: &[TransactionAccount],
    ) -> Result<SignedFeeBumpTransaction> {
        let hash = fee_bump.hash(&self.network_passphrase)?;
        let signatures = self.sign_hash(&hash, accounts).await?;
        Ok(SignedFeeBumpTransaction {
            fee_bump,
            signatures,
        })
    }

    /// Create `number` accounts of `account_type`, returning their addresses
    pub async fn batch_insert(
        &self,
        account_type: AccountType,
        number: usize,
    ) -> Result<Vec<TransactionAccount>> {
        if number == 0 {
            return Err(SigningError::InvalidBatchSize(number));
        }
        self.client_for(account_type)?.batch_insert(number).await
    }

    /// Purge the stored key of an account
    pub async fn delete(&self, account: &TransactionAccount) -> Result<()> {
        self.client_for(account.account_type)?.delete(account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AccountEnvSignatureClient, DbVaultSignatureClient};
    use crate::encryption::AesGcmEncrypter;
    use crate::store::InMemorySignerKeyStore;
    use ledger_client::{KeyPair, Operation, OperationBody};

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    fn host_client(keypair: &KeyPair, passphrase: &str) -> Arc<dyn SignatureClient> {
        Arc::new(
            AccountEnvSignatureClient::new(&keypair.secret(), AccountType::HostStellarEnv, passphrase)
                .unwrap(),
        )
    }

    fn channel_client() -> Arc<dyn SignatureClient> {
        Arc::new(DbVaultSignatureClient::new(
            Arc::new(InMemorySignerKeyStore::new()),
            Arc::new(AesGcmEncrypter::new("secret").unwrap()),
            AccountType::ChannelAccountStellarDb,
            PASSPHRASE,
        ))
    }

    #[tokio::test]
    async fn test_rejects_mixed_networks() {
        let host = KeyPair::generate();
        let result = SignerRouter::new(vec![
            host_client(&host, PASSPHRASE),
            host_client(&host, "Public Global Stellar Network ; September 2015"),
        ]);
        assert!(matches!(
            result,
            Err(SigningError::NetworkPassphraseMismatch { .. })
        ));
        assert!(matches!(SignerRouter::new(vec![]), Err(SigningError::NoClients)));
    }

    #[tokio::test]
    async fn test_signs_across_account_types() {
        let host = KeyPair::generate();
        let router = SignerRouter::new(vec![host_client(&host, PASSPHRASE), channel_client()]).unwrap();

        let channels = router
            .batch_insert(AccountType::ChannelAccountStellarDb, 2)
            .await
            .unwrap();

        let tx = Transaction::new(host.address(), 1).add_operation(Operation::new(
            OperationBody::BeginSponsoringFutureReserves {
                sponsored_id: channels[0].address.clone(),
            },
        ));
        let mut accounts = channels.clone();
        accounts.push(TransactionAccount::host(host.address()));

        let signed = router.sign_stellar_transaction(tx, &accounts).await.unwrap();
        let hash = signed.hash(PASSPHRASE).unwrap();
        assert_eq!(signed.signatures.len(), 3);
        assert!(signed.signatures.iter().all(|s| s.verify(&hash)));
    }

    #[tokio::test]
    async fn test_sign_errors() {
        let host = KeyPair::generate();
        let router = SignerRouter::new(vec![host_client(&host, PASSPHRASE)]).unwrap();
        let tx = Transaction::new(host.address(), 1);

        assert!(matches!(
            router.sign_stellar_transaction(tx.clone(), &[]).await,
            Err(SigningError::NoAccountsProvided)
        ));

        let distribution = TransactionAccount::stellar(
            "GDIST",
            AccountType::DistributionAccountStellarDbVault,
        );
        assert!(matches!(
            router.sign_stellar_transaction(tx, &[distribution]).await,
            Err(SigningError::NoClientForAccountType(
                AccountType::DistributionAccountStellarDbVault
            ))
        ));
    }

    #[tokio::test]
    async fn test_batch_insert_requires_positive_number() {
        let router = SignerRouter::new(vec![channel_client()]).unwrap();
        assert!(matches!(
            router.batch_insert(AccountType::ChannelAccountStellarDb, 0).await,
            Err(SigningError::InvalidBatchSize(0))
        ));
    }
}
