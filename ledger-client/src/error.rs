//! Error taxonomy for ledger interactions

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transaction-level codes that can never succeed on resubmission.
const TERMINAL_TX_CODES: &[&str] = &[
    "tx_bad_auth",
    "tx_bad_auth_extra",
    "tx_insufficient_balance",
    "tx_malformed",
];

/// Operation-level codes that can never succeed on resubmission.
const TERMINAL_OP_CODES: &[&str] = &[
    "op_bad_auth",
    "op_underfunded",
    "op_src_not_authorized",
    "op_no_destination",
    "op_no_trust",
    "op_line_full",
    "op_not_authorized",
    "op_no_issuer",
    "op_malformed",
];

/// Transaction-level codes worth another attempt with a rebuilt transaction.
const RETRYABLE_TX_CODES: &[&str] = &["tx_bad_seq", "tx_insufficient_fee", "tx_too_late"];

/// Result codes returned by the ledger when it rejects a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCodes {
    /// Transaction result code, e.g. `tx_failed`
    pub transaction: String,

    /// Per-operation result codes, in operation order
    #[serde(default)]
    pub operations: Vec<String>,
}

impl ResultCodes {
    /// Codes for a transaction-level rejection without operation results
    pub fn transaction(code: impl Into<String>) -> Self {
        Self {
            transaction: code.into(),
            operations: Vec::new(),
        }
    }

    /// Codes for a `tx_failed` rejection caused by the given operation codes
    pub fn failed_operations<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transaction: "tx_failed".to_string(),
            operations: codes.into_iter().map(Into::into).collect(),
        }
    }

    fn is_terminal(&self) -> bool {
        TERMINAL_TX_CODES.contains(&self.transaction.as_str())
            || self
                .operations
                .iter()
                .any(|code| TERMINAL_OP_CODES.contains(&code.as_str()))
    }
}

impl std::fmt::Display for ResultCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operations.is_empty() {
            write!(f, "{}", self.transaction)
        } else {
            write!(f, "{} [{}]", self.transaction, self.operations.join(", "))
        }
    }
}

/// Ledger error
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The ledger rejected the transaction with result codes
    #[error("transaction rejected: {0}")]
    Rejected(ResultCodes),

    /// The ledger answered with a non-success HTTP status
    #[error("ledger returned status {status}: {detail}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Problem detail
        detail: String,
    },

    /// Account or transaction does not exist on the ledger
    #[error("not found: {0}")]
    NotFound(String),

    /// No answer before the deadline; the outcome is unknown
    #[error("ledger request timed out")]
    Timeout,

    /// Connection-level failure before the ledger answered
    #[error("transport error: {0}")]
    Transport(String),

    /// The transaction could not be built locally
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Key material could not be parsed or used
    #[error("key error: {0}")]
    Key(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Whether this error came from the ledger itself rather than from local code or the network
    pub fn is_ledger_error(&self) -> bool {
        matches!(
            self,
            LedgerError::Rejected(_)
                | LedgerError::Http { .. }
                | LedgerError::NotFound(_)
                | LedgerError::Timeout
        )
    }

    /// Whether resubmitting can never succeed
    pub fn is_terminal(&self) -> bool {
        match self {
            LedgerError::Rejected(codes) => codes.is_terminal(),
            LedgerError::InvalidTransaction(_) | LedgerError::Key(_) => true,
            LedgerError::Http { status, .. } => *status == 400,
            _ => false,
        }
    }

    /// Whether a rebuilt transaction submitted later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Rejected(codes) => {
                !codes.is_terminal() && RETRYABLE_TX_CODES.contains(&codes.transaction.as_str())
            }
            LedgerError::Http { status, .. } => *status == 429 || *status >= 500,
            LedgerError::Timeout | LedgerError::Transport(_) => true,
            _ => false,
        }
    }

    /// Outcome unknown: the transaction may or may not have been applied
    pub fn is_indeterminate(&self) -> bool {
        self.is_gateway_timeout() || matches!(self, LedgerError::Transport(_))
    }

    /// HTTP 429
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LedgerError::Http { status: 429, .. })
    }

    /// HTTP 504 or a local timeout
    pub fn is_gateway_timeout(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout | LedgerError::Http { status: 504, .. }
        )
    }

    /// HTTP 404
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::NotFound(_) | LedgerError::Http { status: 404, .. }
        )
    }

    /// The fee bid was below the network minimum
    pub fn is_insufficient_fee(&self) -> bool {
        self.has_transaction_code("tx_insufficient_fee")
    }

    /// The transaction used a stale sequence number
    pub fn is_bad_sequence(&self) -> bool {
        self.has_transaction_code("tx_bad_seq")
    }

    /// Result codes, when the ledger returned any
    pub fn result_codes(&self) -> Option<&ResultCodes> {
        match self {
            LedgerError::Rejected(codes) => Some(codes),
            _ => None,
        }
    }

    fn has_transaction_code(&self, code: &str) -> bool {
        self.result_codes()
            .map(|codes| codes.transaction == code)
            .unwrap_or(false)
    }
}

impl From<bincode::Error> for LedgerError {
    fn from(err: bincode::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, LedgerError>;
