//! Error types for the disbursement core

use thiserror::Error;

/// Core error
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Tenant does not exist
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// The operation needs a tenant but the context carries none
    #[error("tenant not found in context")]
    TenantNotFoundInContext,

    /// Tenant name cannot be used as a schema name
    #[error("invalid tenant name {0:?}")]
    InvalidTenantName(String),

    /// Tenant distribution account configuration is malformed
    #[error("invalid distribution account for tenant {tenant}: {reason}")]
    InvalidDistributionAccount {
        /// Tenant name
        tenant: String,
        /// What is wrong
        reason: String,
    },

    /// No tenant pool has been opened yet
    #[error("no data sources are available")]
    NoDataSourcesAvailable,

    /// Unrecognized enum value read from storage
    #[error("invalid {kind} value {value:?}")]
    InvalidEnumValue {
        /// Enum name
        kind: &'static str,
        /// Offending value
        value: String,
    },

    /// Amount is not a positive decimal
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, CoreError>;
