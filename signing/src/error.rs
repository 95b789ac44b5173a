//! Error types for the signature service

use disbursement_core::{AccountType, CoreError};
use ledger_client::LedgerError;
use thiserror::Error;

/// Signature service error
#[derive(Debug, Error)]
pub enum SigningError {
    /// No client registered for the account type
    #[error("no signature client registered for account type {0}")]
    NoClientForAccountType(AccountType),

    /// Signing was requested without any account
    #[error("no accounts were provided to sign the transaction")]
    NoAccountsProvided,

    /// Router built from clients configured for different networks
    #[error("network passphrase of all signers should be the same: {expected:?} != {found:?}")]
    NetworkPassphraseMismatch {
        /// Passphrase of the first client
        expected: String,
        /// Conflicting passphrase
        found: String,
    },

    /// Router built without clients
    #[error("at least one signature client is required")]
    NoClients,

    /// Batch size out of range
    #[error("number of accounts to insert must be at least 1, got {0}")]
    InvalidBatchSize(usize),

    /// The client cannot perform the operation
    #[error("{operation} is not supported for account type {account_type}")]
    Unsupported {
        /// Operation name
        operation: &'static str,
        /// Account type of the client
        account_type: AccountType,
    },

    /// The client holds no key for the address
    #[error("no signing key for account {0}")]
    AccountNotFound(String),

    /// Missing or invalid signer configuration
    #[error("signer configuration error: {0}")]
    Configuration(String),

    /// Key encryption or decryption failed
    #[error("key encryption error: {0}")]
    Encryption(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Key or transaction error
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Core error
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type
pub type Result<T> = std::result::Result<T, SigningError>;
