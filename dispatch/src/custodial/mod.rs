//! Custodial payment provider boundary
//!
//! The provider moves stablecoins out of a custodial wallet either as a transfer to a
//! blockchain address or as a payout to an address book recipient. Every creating
//! request carries an idempotency key; the provider returns the original object when a
//! key is replayed.

mod http;
mod mock;

pub use http::{CustodialHttpClient, CustodialHttpConfig};
pub use mock::MockCustodialClient;

use crate::{DispatchError, Result};
use async_trait::async_trait;
use disbursement_core::PaymentStatus;
use serde::{Deserialize, Serialize};

/// Chain identifier of the ledger at the provider
pub const STELLAR_CHAIN_CODE: &str = "XLM";

/// Provider error codes meaning the destination address was refused.
/// A recipient that hits one of these is marked denied.
pub const DESTINATION_ADDRESS_ERROR_CODES: &[i64] = &[5003, 5004, 5011];

/// Transfer of funds from the custodial wallet to a ledger address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Idempotency key
    pub idempotency_key: String,
    /// Custodial wallet paying
    pub source_wallet_id: String,
    /// Ledger address receiving
    pub destination_address: String,
    /// Memo attached on the ledger
    pub destination_memo: Option<String>,
    /// Decimal amount
    pub amount: String,
    /// Ledger asset code
    pub asset_code: String,
}

/// Payout from the custodial wallet to an address book recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    /// Idempotency key
    pub idempotency_key: String,
    /// Custodial wallet paying
    pub source_wallet_id: String,
    /// Address book recipient
    pub recipient_id: String,
    /// Decimal amount
    pub amount: String,
    /// Ledger asset code
    pub asset_code: String,
}

/// Address book entry to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRequest {
    /// Idempotency key
    pub idempotency_key: String,
    /// Ledger address
    pub address: String,
    /// Memo the address needs
    pub address_tag: Option<String>,
    /// Chain identifier
    pub chain: String,
    /// Display name at the provider
    pub nickname: String,
}

/// Transfer or payout as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    /// Provider id
    pub id: String,
    /// Provider status (`pending`, `complete`, `failed`)
    pub status: String,
    /// Ledger transaction hash once settled
    #[serde(default)]
    pub transaction_hash: Option<String>,
    /// Provider error code once failed
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Payouts share the transfer shape
pub type Payout = Transfer;

/// Address book recipient as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Provider id
    pub id: String,
    /// Provider status
    pub status: String,
}

/// Custodial provider API
#[async_trait]
pub trait CustodialClient: Send + Sync {
    /// Create a transfer
    async fn send_transfer(&self, request: &TransferRequest) -> Result<Transfer>;

    /// Transfer by provider id
    async fn get_transfer_by_id(&self, id: &str) -> Result<Transfer>;

    /// Create a payout
    async fn send_payout(&self, request: &PayoutRequest) -> Result<Payout>;

    /// Payout by provider id
    async fn get_payout_by_id(&self, id: &str) -> Result<Payout>;

    /// Create an address book recipient
    async fn post_recipient(&self, request: &RecipientRequest) -> Result<Recipient>;
}

/// Payment status matching a provider transfer status
pub fn transfer_status_to_payment_status(status: &str) -> Result<PaymentStatus> {
    match status {
        "pending" => Ok(PaymentStatus::Pending),
        "complete" => Ok(PaymentStatus::Success),
        "failed" => Ok(PaymentStatus::Failed),
        other => Err(DispatchError::UnknownCustodialStatus(other.to_string())),
    }
}

/// Provider currency of a ledger asset code
pub fn currency_for_asset(asset_code: &str) -> Result<&'static str> {
    match asset_code.to_ascii_uppercase().as_str() {
        "USDC" => Ok("USD"),
        "EURC" => Ok("EUR"),
        other => Err(DispatchError::InvalidRequest(format!(
            "asset {} is not supported by the custodial provider",
            other
        ))),
    }
}

/// Whether `error` is a provider refusal of the destination address
pub fn is_destination_address_error(error: &DispatchError) -> bool {
    matches!(error, DispatchError::Custodial(api) if DESTINATION_ADDRESS_ERROR_CODES.contains(&api.code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CustodialApiError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(transfer_status_to_payment_status("pending").unwrap(), PaymentStatus::Pending);
        assert_eq!(transfer_status_to_payment_status("complete").unwrap(), PaymentStatus::Success);
        assert_eq!(transfer_status_to_payment_status("failed").unwrap(), PaymentStatus::Failed);
        assert!(matches!(
            transfer_status_to_payment_status("running"),
            Err(DispatchError::UnknownCustodialStatus(s)) if s == "running"
        ));
    }

    #[test]
    fn test_currency_for_asset() {
        assert_eq!(currency_for_asset("usdc").unwrap(), "USD");
        assert_eq!(currency_for_asset("EURC").unwrap(), "EUR");
        assert!(currency_for_asset("XLM").is_err());
    }

    #[test]
    fn test_destination_address_error() {
        let refused = DispatchError::Custodial(CustodialApiError {
            status_code: 400,
            code: 5011,
            message: "address is not allowed".to_string(),
        });
        let other = DispatchError::Custodial(CustodialApiError {
            status_code: 400,
            code: 2,
            message: "invalid amount".to_string(),
        });
        assert!(is_destination_address_error(&refused));
        assert!(!is_destination_address_error(&other));
        assert!(!is_destination_address_error(&DispatchError::CustodialTransport("reset".into())));
    }
}
