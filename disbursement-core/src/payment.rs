//! Payments and the records they reference
//!
//! Payments, receiver wallets and disbursements reference each other by id. A
//! `PaymentBatch` is the arena loaded for one dispatch: the payments plus the wallets
//! and disbursements they point at, joined explicitly by the store.

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Decimal places used for ledger amounts
pub const LEDGER_AMOUNT_SCALE: u32 = 7;

/// Code of the native ledger asset
pub const NATIVE_ASSET_CODE: &str = "XLM";

string_enum! {
    /// Payment lifecycle
    pub enum PaymentStatus {
        /// Created, not yet eligible
        Draft => "DRAFT",
        /// Eligible for dispatch
        Ready => "READY",
        /// Handed to a settlement rail
        Pending => "PENDING",
        /// Held by an operator
        Paused => "PAUSED",
        /// Settled
        Success => "SUCCESS",
        /// Failed, see the status message
        Failed => "FAILED",
        /// Cancelled by an operator
        Cancelled => "CANCELED",
    }
}

impl PaymentStatus {
    /// Whether no further transition is expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Success | PaymentStatus::Cancelled)
    }
}

string_enum! {
    /// Receiver wallet lifecycle
    pub enum ReceiverWalletStatus {
        /// Created
        Draft => "DRAFT",
        /// Invited
        Ready => "READY",
        /// Receiver completed registration
        Registered => "REGISTERED",
        /// Flagged by an operator
        Flagged => "FLAGGED",
    }
}

string_enum! {
    /// Disbursement lifecycle
    pub enum DisbursementStatus {
        /// Created
        Draft => "DRAFT",
        /// Instructions uploaded
        Ready => "READY",
        /// Payments are being sent
        Started => "STARTED",
        /// Held by an operator
        Paused => "PAUSED",
        /// All payments processed
        Completed => "COMPLETED",
    }
}

/// Asset of a payment. The native asset has an empty issuer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Asset code
    pub code: String,
    /// Issuer address
    pub issuer: String,
}

impl Asset {
    /// Asset from code and issuer
    pub fn new(code: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            issuer: issuer.into(),
        }
    }

    /// Whether this is the native asset
    pub fn is_native(&self) -> bool {
        self.code.eq_ignore_ascii_case(NATIVE_ASSET_CODE) && self.issuer.is_empty()
    }
}

/// Entry in a payment's status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusHistoryEntry {
    /// Status entered
    pub status: PaymentStatus,
    /// Reason, if any
    pub status_message: String,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

/// Payment to one receiver wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment id
    pub id: String,
    /// Decimal amount as entered
    pub amount: String,
    /// Asset paid
    pub asset: Asset,
    /// Status
    pub status: PaymentStatus,
    /// Transition history, oldest first
    pub status_history: Vec<PaymentStatusHistoryEntry>,
    /// Receiver wallet id
    pub receiver_wallet_id: String,
    /// Disbursement id
    pub disbursement_id: String,
    /// Ledger transaction hash once settled on the ledger
    pub stellar_transaction_id: Option<String>,
    /// Custodial transfer or payout id
    pub circle_transfer_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// New Ready payment
    pub fn new(
        id: impl Into<String>,
        amount: impl Into<String>,
        asset: Asset,
        receiver_wallet_id: impl Into<String>,
        disbursement_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            amount: amount.into(),
            asset,
            status: PaymentStatus::Ready,
            status_history: vec![PaymentStatusHistoryEntry {
                status: PaymentStatus::Ready,
                status_message: String::new(),
                timestamp: now,
            }],
            receiver_wallet_id: receiver_wallet_id.into(),
            disbursement_id: disbursement_id.into(),
            stellar_transaction_id: None,
            circle_transfer_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, appending to the history
    pub fn transition(&mut self, status: PaymentStatus, message: impl Into<String>) {
        let now = Utc::now();
        self.status = status;
        self.status_history.push(PaymentStatusHistoryEntry {
            status,
            status_message: message.into(),
            timestamp: now,
        });
        self.updated_at = now;
    }

    /// Message of the latest transition
    pub fn status_message(&self) -> &str {
        self.status_history
            .last()
            .map(|entry| entry.status_message.as_str())
            .unwrap_or_default()
    }
}

/// Receiver wallet a payment is sent to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverWallet {
    /// Wallet id
    pub id: String,
    /// Receiver id
    pub receiver_id: String,
    /// Status
    pub status: ReceiverWalletStatus,
    /// Ledger address provided at registration
    pub stellar_address: String,
    /// Memo the receiver asked for
    pub stellar_memo: Option<String>,
    /// Memo type (`text`, `id` or `hash`)
    pub stellar_memo_type: Option<String>,
}

impl ReceiverWallet {
    /// Registered wallet with a ledger address
    pub fn registered(
        id: impl Into<String>,
        receiver_id: impl Into<String>,
        stellar_address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            receiver_id: receiver_id.into(),
            status: ReceiverWalletStatus::Registered,
            stellar_address: stellar_address.into(),
            stellar_memo: None,
            stellar_memo_type: None,
        }
    }
}

/// Disbursement a payment belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disbursement {
    /// Disbursement id
    pub id: String,
    /// Name
    pub name: String,
    /// Status
    pub status: DisbursementStatus,
}

/// Payments loaded for dispatch together with the records they reference
#[derive(Debug, Clone, Default)]
pub struct PaymentBatch {
    payments: Vec<Payment>,
    receiver_wallets: HashMap<String, ReceiverWallet>,
    disbursements: HashMap<String, Disbursement>,
}

impl PaymentBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a payment and the records it references
    pub fn push(&mut self, payment: Payment, wallet: ReceiverWallet, disbursement: Disbursement) {
        self.receiver_wallets.insert(wallet.id.clone(), wallet);
        self.disbursements
            .insert(disbursement.id.clone(), disbursement);
        self.payments.push(payment);
    }

    /// Payments, in load order
    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    /// Receiver wallet referenced by a payment
    pub fn receiver_wallet(&self, payment: &Payment) -> Option<&ReceiverWallet> {
        self.receiver_wallets.get(&payment.receiver_wallet_id)
    }

    /// Disbursement referenced by a payment
    pub fn disbursement(&self, payment: &Payment) -> Option<&Disbursement> {
        self.disbursements.get(&payment.disbursement_id)
    }

    /// Payment ids
    pub fn payment_ids(&self) -> Vec<String> {
        self.payments.iter().map(|p| p.id.clone()).collect()
    }

    /// Number of payments
    pub fn len(&self) -> usize {
        self.payments.len()
    }

    /// Whether the batch has no payments
    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }

    /// Keep the payments matching `keep`, returning the others in a second batch
    pub fn split_off<F>(self, mut keep: F) -> (PaymentBatch, PaymentBatch)
    where
        F: FnMut(&Payment) -> bool,
    {
        let (kept, rest): (Vec<Payment>, Vec<Payment>) =
            self.payments.into_iter().partition(|p| keep(p));

        let kept = PaymentBatch {
            payments: kept,
            receiver_wallets: self.receiver_wallets.clone(),
            disbursements: self.disbursements.clone(),
        };
        let rest = PaymentBatch {
            payments: rest,
            receiver_wallets: self.receiver_wallets,
            disbursements: self.disbursements,
        };
        (kept, rest)
    }
}

/// Parse a strictly positive amount
pub fn parse_positive_amount(amount: &str) -> Option<Decimal> {
    Decimal::from_str(amount.trim())
        .ok()
        .filter(|value| *value > Decimal::ZERO)
}

/// Parse an amount and scale it to exactly 7 decimal places. Amounts that round to
/// zero are rejected.
pub fn ledger_amount(amount: &str) -> Option<Decimal> {
    let mut rounded = parse_positive_amount(amount)?.round_dp(LEDGER_AMOUNT_SCALE);
    rounded.rescale(LEDGER_AMOUNT_SCALE);
    (rounded > Decimal::ZERO).then_some(rounded)
}

/// Format an amount with exactly 7 decimal places, as ledger amounts are stored
pub fn format_ledger_amount(amount: &str) -> Result<String> {
    ledger_amount(amount)
        .map(|value| value.to_string())
        .ok_or_else(|| CoreError::InvalidAmount(amount.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_format_ledger_amount() {
        assert_eq!(format_ledger_amount("100").unwrap(), "100.0000000");
        assert_eq!(format_ledger_amount("0.1").unwrap(), "0.1000000");
        assert_eq!(format_ledger_amount("1.123456789").unwrap(), "1.1234568");
        assert!(format_ledger_amount("0").is_err());
        assert!(format_ledger_amount("-5").is_err());
        assert!(format_ledger_amount("ten").is_err());
        assert!(format_ledger_amount("0.00000001").is_err());
    }

    #[test]
    fn test_native_asset() {
        assert!(Asset::new("XLM", "").is_native());
        assert!(!Asset::new("XLM", "GISSUER").is_native());
        assert!(!Asset::new("USDC", "").is_native());
    }

    #[test]
    fn test_transition_appends_history() {
        let mut payment = Payment::new("p1", "10", Asset::new("USDC", "GISSUER"), "rw1", "d1");
        payment.transition(PaymentStatus::Failed, "receiver wallet is not registered");

        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.status_history.len(), 2);
        assert_eq!(payment.status_message(), "receiver wallet is not registered");
    }

    #[test]
    fn test_batch_split_keeps_references() {
        let mut batch = PaymentBatch::new();
        let wallet = ReceiverWallet::registered("rw1", "r1", "GRECEIVER");
        let disbursement = Disbursement {
            id: "d1".to_string(),
            name: "March payroll".to_string(),
            status: DisbursementStatus::Started,
        };
        let asset = Asset::new("USDC", "GISSUER");
        batch.push(Payment::new("p1", "10", asset.clone(), "rw1", "d1"), wallet.clone(), disbursement.clone());
        batch.push(Payment::new("p2", "0", asset, "rw1", "d1"), wallet, disbursement);

        let (valid, invalid) = batch.split_off(|p| parse_positive_amount(&p.amount).is_some());
        assert_eq!(valid.payment_ids(), vec!["p1".to_string()]);
        assert_eq!(invalid.len(), 1);
        assert!(invalid.receiver_wallet(&invalid.payments()[0]).is_some());
    }

    proptest! {
        #[test]
        fn test_formatted_amount_has_seven_decimals(units in 1u64..10_000_000_000u64, scale in 0u32..8) {
            let amount = Decimal::new(units as i64, scale).to_string();
            let formatted = format_ledger_amount(&amount).unwrap();
            let (_, fraction) = formatted.split_once('.').unwrap();
            prop_assert_eq!(fraction.len(), 7);
        }
    }
}
