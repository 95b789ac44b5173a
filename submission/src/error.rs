//! Error types for transaction submission

use disbursement_core::CoreError;
use ledger_client::LedgerError;
use signing::SigningError;
use thiserror::Error;

/// Submission errors
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// Channel account batch outside `1..=max`
    #[error("invalid number of channel accounts to create {requested}: cannot create more than {max} channel accounts, nor fewer than 1")]
    InvalidChannelAccountCount {
        /// Requested number
        requested: usize,
        /// Largest accepted batch
        max: usize,
    },

    /// Desired channel account total outside `1..=max`
    #[error("channel accounts count {requested} is outside the limit of 1 to {max}")]
    InvalidTargetCount {
        /// Requested total
        requested: usize,
        /// Largest accepted total
        max: usize,
    },

    /// Channel account is leased by a submission
    #[error("channel account {0} is in use")]
    ChannelAccountInUse(String),

    /// The lease pool was shut down
    #[error("no channel accounts are available")]
    NoChannelAccountsAvailable,

    /// Channel account is not managed here
    #[error("channel account {0} not found")]
    ChannelAccountNotFound(String),

    /// Submitter transaction does not exist
    #[error("submitter transaction {0} not found")]
    TransactionNotFound(String),

    /// Status change not allowed by the lifecycle
    #[error("cannot move submitter transaction {id} from {from} to {to}")]
    InvalidTransition {
        /// Transaction id
        id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// An earlier attempt of the row may still be applied by the ledger
    #[error("submitter transaction {id} has an attempt in flight until {until}")]
    AttemptInFlight {
        /// Transaction id
        id: String,
        /// End of the attempt's validity window
        until: chrono::DateTime<chrono::Utc>,
    },

    /// Transaction row cannot be turned into a ledger transaction
    #[error("invalid submitter transaction: {0}")]
    InvalidTransaction(String),

    /// Ledger error
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Signing error
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// Domain error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event bus error
    #[error("Event bus error: {0}")]
    Bus(#[from] message_bus::Error),
}

impl SubmissionError {
    /// Ledger error behind this one, if any
    pub fn ledger_error(&self) -> Option<&LedgerError> {
        match self {
            SubmissionError::Ledger(e) => Some(e),
            SubmissionError::Signing(SigningError::Ledger(e)) => Some(e),
            _ => None,
        }
    }
}

/// Result type for submission operations
pub type Result<T> = std::result::Result<T, SubmissionError>;
