//! Ledger client boundary

use crate::transaction::{Asset, TransactionEnvelope};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance of one asset held by an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Asset held
    pub asset: Asset,
    /// Amount held
    pub amount: Decimal,
}

/// Account state as seen by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetail {
    /// Account address
    pub address: String,
    /// Current sequence number
    pub sequence: i64,
    /// Balances, native first
    pub balances: Vec<Balance>,
    /// Account paying this account's reserves, if sponsored
    pub sponsor: Option<String>,
}

impl AccountDetail {
    /// Balance of `asset`, zero when the account holds none
    pub fn balance_of(&self, asset: &Asset) -> Decimal {
        self.balances
            .iter()
            .find(|b| &b.asset == asset)
            .map(|b| b.amount)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Response to an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Transaction hash
    pub hash: String,
    /// Ledger that included the transaction
    pub ledger: u64,
}

/// Transaction lookup result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction hash
    pub hash: String,
    /// Whether the transaction was applied successfully
    pub successful: bool,
    /// Ledger that included the transaction
    pub ledger: u64,
}

/// Remote ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Network passphrase the ledger validates signatures against
    fn network_passphrase(&self) -> &str;

    /// Look up an account; `LedgerError::NotFound` when it does not exist
    async fn account(&self, address: &str) -> Result<AccountDetail>;

    /// Submit a signed envelope and wait for the outcome
    async fn submit(&self, envelope: &TransactionEnvelope) -> Result<SubmitResponse>;

    /// Look up a previously submitted transaction
    async fn transaction(&self, hash: &str) -> Result<TransactionRecord>;
}
