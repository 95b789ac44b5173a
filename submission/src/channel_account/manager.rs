//! Channel account provisioning on the ledger
//!
//! Channel accounts are created with zero balance under the host account's sponsorship,
//! and retired by merging them back into the host. Their keys live in the signer
//! router's channel account vault.

use super::pool::ChannelAccountPool;
use crate::metrics::{CHANNEL_ACCOUNTS_CREATED, CHANNEL_ACCOUNTS_DELETED};
use crate::{Result, SubmissionError};
use disbursement_core::{AccountType, TransactionAccount};
use ledger_client::{
    Asset, LedgerClient, Operation, OperationBody, Transaction, TransactionEnvelope, BASE_FEE,
};
use rust_decimal::Decimal;
use signing::{SignatureService, SignerKeyStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Accounts one creation transaction can hold: three operations and one signature each,
/// plus the host signature, within the signature limit
pub const MAX_CHANNEL_ACCOUNTS_PER_TX: usize = 19;

/// Upper bound on managed channel accounts
pub const MAX_CHANNEL_ACCOUNTS: usize = 1000;

/// Native amount sent to a channel account before merging it, to cover the merge
pub const REVOKE_SPONSORSHIP_RESERVE_AMOUNT: Decimal = Decimal::from_parts(15, 0, 0, false, 1);

const CHANNEL_ACCOUNT_TX_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of a verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelAccountsReport {
    /// Accounts checked
    pub total: usize,
    /// Accounts missing on the ledger
    pub invalid: Vec<String>,
    /// Invalid accounts whose keys were purged
    pub deleted: usize,
}

/// Creates, retires and audits channel accounts
pub struct ChannelAccountManager {
    ledger: Arc<dyn LedgerClient>,
    signatures: Arc<SignatureService>,
    key_store: Arc<dyn SignerKeyStore>,
    pool: Arc<ChannelAccountPool>,
    base_fee: u32,
    // Host-sourced transactions share one sequence number.
    host_sequence: Mutex<()>,
}

impl ChannelAccountManager {
    /// Create a manager. `key_store` must be the store behind the channel account signer.
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        signatures: Arc<SignatureService>,
        key_store: Arc<dyn SignerKeyStore>,
        pool: Arc<ChannelAccountPool>,
    ) -> Self {
        Self {
            ledger,
            signatures,
            key_store,
            pool,
            base_fee: BASE_FEE,
            host_sequence: Mutex::new(()),
        }
    }

    /// Override the per-operation fee
    pub fn with_base_fee(mut self, base_fee: u32) -> Self {
        self.base_fee = base_fee;
        self
    }

    /// Lease pool fed by this manager
    pub fn pool(&self) -> &Arc<ChannelAccountPool> {
        &self.pool
    }

    /// Put every stored channel account in the lease pool
    pub async fn load_pool(&self) -> Result<usize> {
        let signers = self.key_store.list().await?;
        let added = signers
            .into_iter()
            .filter(|s| self.pool.add(s.public_key.clone()))
            .count();
        info!(added, pool_size = self.pool.size(), "Loaded channel accounts");
        Ok(added)
    }

    /// Create `number` sponsored channel accounts in one transaction. New keys are purged
    /// again if the transaction is not applied.
    pub async fn create_channel_accounts_on_chain(&self, number: usize) -> Result<Vec<String>> {
        if number == 0 || number > MAX_CHANNEL_ACCOUNTS_PER_TX {
            return Err(SubmissionError::InvalidChannelAccountCount {
                requested: number,
                max: MAX_CHANNEL_ACCOUNTS_PER_TX,
            });
        }

        let accounts = self
            .signatures
            .router()
            .batch_insert(AccountType::ChannelAccountStellarDb, number)
            .await?;

        if let Err(e) = self.submit_creation(&accounts).await {
            error!(number, error = %e, "Creating channel accounts failed, purging their keys");
            self.discard_signers(&accounts).await;
            return Err(e);
        }

        let addresses: Vec<String> = accounts.into_iter().map(|a| a.address).collect();
        for address in &addresses {
            self.pool.add(address.clone());
        }
        CHANNEL_ACCOUNTS_CREATED.inc_by(addresses.len() as u64);
        info!(number = addresses.len(), "Created sponsored channel accounts");
        Ok(addresses)
    }

    async fn submit_creation(&self, accounts: &[TransactionAccount]) -> Result<()> {
        let host = self.signatures.host_account().clone();
        let _sequence = self.host_sequence.lock().await;
        let host_detail = self.ledger.account(&host.address).await?;

        let mut tx = Transaction::new(host.address.clone(), host_detail.sequence + 1)
            .with_timeout(CHANNEL_ACCOUNT_TX_TIMEOUT);
        for account in accounts {
            tx = tx
                .add_operation(Operation::new(OperationBody::BeginSponsoringFutureReserves {
                    sponsored_id: account.address.clone(),
                }))
                .add_operation(Operation::new(OperationBody::CreateAccount {
                    destination: account.address.clone(),
                    starting_balance: Decimal::ZERO,
                }))
                .add_operation(Operation::with_source(
                    account.address.clone(),
                    OperationBody::EndSponsoringFutureReserves,
                ));
        }
        let tx = tx.build(self.base_fee)?;

        let mut signers = accounts.to_vec();
        signers.push(host);
        let signed = self
            .signatures
            .router()
            .sign_stellar_transaction(tx, &signers)
            .await?;

        self.ledger
            .submit(&TransactionEnvelope::Transaction(signed))
            .await?;
        Ok(())
    }

    async fn discard_signers(&self, accounts: &[TransactionAccount]) {
        for account in accounts {
            if let Err(e) = self.signatures.router().delete(account).await {
                error!(channel_account = %account.address, error = %e, "Failed to purge channel account key");
            }
        }
    }

    /// Merge a channel account back into the host and purge its key. An account missing
    /// on the ledger only has its key purged.
    pub async fn delete_channel_account_on_chain(&self, address: &str) -> Result<()> {
        let removed_from_pool = self.pool.take_for_removal(address)?;

        if let Err(e) = self.merge_into_host(address).await {
            // Only an account still on the ledger can take payments again.
            if removed_from_pool && self.ledger.account(address).await.is_ok() {
                self.pool.add(address);
            }
            return Err(e);
        }

        self.signatures
            .router()
            .delete(&TransactionAccount::channel(address))
            .await?;
        CHANNEL_ACCOUNTS_DELETED.inc();
        info!(channel_account = %address, "Deleted channel account");
        Ok(())
    }

    async fn merge_into_host(&self, address: &str) -> Result<()> {
        match self.ledger.account(address).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!(channel_account = %address, "Account does not exist on the network");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let host = self.signatures.host_account().clone();
        let _sequence = self.host_sequence.lock().await;
        let host_detail = self.ledger.account(&host.address).await?;

        let tx = Transaction::new(host.address.clone(), host_detail.sequence + 1)
            .add_operation(Operation::new(OperationBody::Payment {
                destination: address.to_string(),
                asset: Asset::native(),
                amount: REVOKE_SPONSORSHIP_RESERVE_AMOUNT,
            }))
            .add_operation(Operation::new(OperationBody::RevokeAccountSponsorship {
                account_id: address.to_string(),
            }))
            .add_operation(Operation::with_source(
                address,
                OperationBody::AccountMerge {
                    destination: host.address.clone(),
                },
            ))
            .with_timeout(CHANNEL_ACCOUNT_TX_TIMEOUT)
            .build(self.base_fee)?;

        // The host authorizes the revocation, the channel account its own merge.
        let signed = self
            .signatures
            .router()
            .sign_stellar_transaction(tx, &[host, TransactionAccount::channel(address)])
            .await?;
        self.ledger
            .submit(&TransactionEnvelope::Transaction(signed))
            .await?;
        Ok(())
    }

    /// Create `amount` channel accounts in batches
    pub async fn create_channel_accounts(&self, mut amount: usize) -> Result<Vec<String>> {
        let mut created = Vec::with_capacity(amount);
        while amount > 0 {
            let batch = amount.min(MAX_CHANNEL_ACCOUNTS_PER_TX);
            let addresses = self.create_channel_accounts_on_chain(batch).await?;
            amount -= addresses.len();
            created.extend(addresses);
        }
        Ok(created)
    }

    /// Delete up to `count` channel accounts that are not leased. Returns how many went.
    pub async fn delete_channel_accounts(&self, count: usize) -> Result<usize> {
        let mut deleted = 0;
        for signer in self.key_store.list().await? {
            if deleted == count {
                break;
            }
            match self.delete_channel_account_on_chain(&signer.public_key).await {
                Ok(()) => deleted += 1,
                Err(SubmissionError::ChannelAccountInUse(address)) => {
                    info!(channel_account = %address, "Skipping leased channel account");
                }
                Err(e) => return Err(e),
            }
        }

        if deleted < count {
            warn!(requested = count, deleted, "Could not find enough free channel accounts to delete");
        }
        Ok(deleted)
    }

    /// Create or delete accounts until exactly `target` are managed
    pub async fn ensure_channel_accounts_count(&self, target: usize) -> Result<()> {
        if target == 0 || target > MAX_CHANNEL_ACCOUNTS {
            return Err(SubmissionError::InvalidTargetCount {
                requested: target,
                max: MAX_CHANNEL_ACCOUNTS,
            });
        }

        let current = self.view_channel_accounts_count().await?;
        info!(current, target, "Ensuring channel accounts count");

        if current > target {
            self.delete_channel_accounts(current - target).await?;
        } else if current < target {
            self.create_channel_accounts(target - current).await?;
        }
        Ok(())
    }

    /// Check every stored account exists on the ledger, optionally purging the ones
    /// that do not
    pub async fn verify_channel_accounts(&self, delete_invalid: bool) -> Result<ChannelAccountsReport> {
        let signers = self.key_store.list().await?;
        let mut report = ChannelAccountsReport {
            total: signers.len(),
            ..Default::default()
        };

        for signer in signers {
            let address = signer.public_key;
            match self.ledger.account(&address).await {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }

            warn!(channel_account = %address, delete_invalid, "Account does not exist on the network");
            if delete_invalid {
                self.pool.take_for_removal(&address)?;
                self.key_store.delete(&address).await?;
                report.deleted += 1;
            }
            report.invalid.push(address);
        }

        if report.invalid.is_empty() {
            info!(total = report.total, "No invalid channel accounts discovered");
        }
        Ok(report)
    }

    /// Number of stored channel accounts
    pub async fn view_channel_accounts_count(&self) -> Result<usize> {
        Ok(self.key_store.count().await?)
    }
}
