//! Error types for payment dispatch

use disbursement_core::{CoreError, PaymentStatus, Platform};
use serde::{Deserialize, Serialize};
use submission::SubmissionError;
use thiserror::Error;

/// Reason a payment cannot be sent
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Payment is not Ready
    #[error("payment {payment_id} is not in {expected} state")]
    PaymentNotReady {
        /// Payment id
        payment_id: String,
        /// Required status
        expected: PaymentStatus,
    },

    /// Receiver wallet is not Registered
    #[error("receiver wallet {wallet_id} for payment {payment_id} is not in REGISTERED state")]
    ReceiverWalletNotRegistered {
        /// Receiver wallet id
        wallet_id: String,
        /// Payment id
        payment_id: String,
    },

    /// Disbursement is not Started
    #[error("disbursement {disbursement_id} for payment {payment_id} is not in STARTED state")]
    DisbursementNotStarted {
        /// Disbursement id
        disbursement_id: String,
        /// Payment id
        payment_id: String,
    },

    /// Receiver wallet was not loaded with the payment
    #[error("receiver wallet {wallet_id} for payment {payment_id} was not found")]
    ReceiverWalletMissing {
        /// Receiver wallet id
        wallet_id: String,
        /// Payment id
        payment_id: String,
    },

    /// Disbursement was not loaded with the payment
    #[error("disbursement {disbursement_id} for payment {payment_id} was not found")]
    DisbursementMissing {
        /// Disbursement id
        disbursement_id: String,
        /// Payment id
        payment_id: String,
    },

    /// Empty payment id
    #[error("payment ID is empty for Payment")]
    EmptyPaymentId,

    /// Empty asset code
    #[error("payment asset code is empty for payment {0}")]
    EmptyAssetCode(String),

    /// Empty issuer on a non-native asset
    #[error("payment asset issuer is empty for payment {0}")]
    EmptyAssetIssuer(String),

    /// Amount not strictly positive
    #[error("payment amount is invalid for payment {0}")]
    InvalidAmount(String),

    /// Receiver wallet has no address
    #[error("payment receiver wallet stellar address is empty for payment {0}")]
    EmptyDestination(String),
}

/// Error returned by the custodial provider API
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("custodial API error (status {status_code}, code {code}): {message}")]
pub struct CustodialApiError {
    /// HTTP status
    pub status_code: u16,
    /// Provider error code
    pub code: i64,
    /// Provider message
    pub message: String,
}

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Payment failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Provider rejected a request
    #[error(transparent)]
    Custodial(#[from] CustodialApiError),

    /// Provider could not be reached
    #[error("custodial transport error: {0}")]
    CustodialTransport(String),

    /// Provider returned a status this engine does not know
    #[error("unknown custodial transfer status {0:?}")]
    UnknownCustodialStatus(String),

    /// Distribution account is on another platform
    #[error("distribution account for tenant {tenant_id} is not a {expected} account")]
    PlatformMismatch {
        /// Tenant id
        tenant_id: String,
        /// Platform the caller needs
        expected: Platform,
    },

    /// No dispatcher registered for a platform
    #[error("no payment dispatcher for platform {0}")]
    NoDispatcher(Platform),

    /// Custodial recipient creation kept failing
    #[error("custodial recipient creation failed too many times")]
    RecipientCreationFailedTooManyTimes,

    /// Custodial recipient exists but is not active yet
    #[error("custodial recipient is not ready, status: {0}")]
    RecipientNotReady(String),

    /// Record does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Store used after its database transaction was committed or rolled back
    #[error("database transaction is already finished")]
    TransactionFinished,

    /// Request cannot be built from the stored records
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Some transfers could not be reconciled
    #[error("reconciled {attempted} transfer requests with {failed} errors: {errors}")]
    Reconciliation {
        /// Requests looked at
        attempted: usize,
        /// Requests that failed
        failed: usize,
        /// Joined error messages
        errors: String,
    },

    /// Domain error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Submission error
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event bus error
    #[error("Event bus error: {0}")]
    Bus(#[from] message_bus::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    /// Whether the error came back from the custodial provider
    pub fn is_custodial(&self) -> bool {
        matches!(
            self,
            DispatchError::Custodial(_) | DispatchError::CustodialTransport(_)
        )
    }
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
