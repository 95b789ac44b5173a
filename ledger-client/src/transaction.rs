//! Ledger transaction model
//!
//! Transactions are hashed as `SHA-256(network_id || tag || bincode(body))`, where
//! `network_id` is the SHA-256 of the network passphrase. Signatures are made over that
//! hash, so a transaction signed for one network is invalid on any other.

use crate::keys::KeyPair;
use crate::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Maximum operations in a single transaction
pub const MAX_OPERATIONS_PER_TX: usize = 100;

/// Maximum signatures attached to a single envelope
pub const MAX_SIGNATURES: usize = 20;

/// Base fee per operation, in stroops
pub const BASE_FEE: u32 = 100;

/// Maximum size of a text memo, in bytes
pub const MAX_TEXT_MEMO_BYTES: usize = 28;

/// Code of the native asset
pub const NATIVE_ASSET_CODE: &str = "XLM";

/// Ledger asset. The native asset has no issuer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Asset code
    pub code: String,
    /// Issuing account, `None` for the native asset
    pub issuer: Option<String>,
}

impl Asset {
    /// Native asset
    pub fn native() -> Self {
        Self {
            code: NATIVE_ASSET_CODE.to_string(),
            issuer: None,
        }
    }

    /// Issued asset
    pub fn credit(code: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            issuer: Some(issuer.into()),
        }
    }

    /// Build from stored code/issuer columns
    pub fn from_parts(code: &str, issuer: &str) -> Self {
        if issuer.is_empty() && code.eq_ignore_ascii_case(NATIVE_ASSET_CODE) {
            Self::native()
        } else {
            Self::credit(code, issuer)
        }
    }

    /// Whether this is the native asset
    pub fn is_native(&self) -> bool {
        self.issuer.is_none()
    }
}

/// Transaction memo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Memo {
    /// No memo
    #[default]
    None,
    /// UTF-8 text, at most 28 bytes
    Text(String),
    /// Unsigned 64-bit id
    Id(u64),
    /// 32-byte hash
    Hash([u8; 32]),
}

impl Memo {
    /// Build a text memo, rejecting values longer than 28 bytes
    pub fn text(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.len() > MAX_TEXT_MEMO_BYTES {
            return Err(LedgerError::InvalidTransaction(format!(
                "text memo exceeds {} bytes",
                MAX_TEXT_MEMO_BYTES
            )));
        }
        Ok(Memo::Text(value))
    }

    /// Parse a memo from its stored value and type (`text`, `id` or `hash`)
    pub fn parse(value: &str, memo_type: &str) -> Result<Self> {
        if value.is_empty() {
            return Ok(Memo::None);
        }

        match memo_type {
            "text" => Memo::text(value),
            "id" => value.parse::<u64>().map(Memo::Id).map_err(|_| {
                LedgerError::InvalidTransaction(format!("invalid id memo {:?}", value))
            }),
            "hash" => {
                let bytes = hex::decode(value).map_err(|_| {
                    LedgerError::InvalidTransaction("hash memo is not valid hex".to_string())
                })?;
                let hash: [u8; 32] = bytes.try_into().map_err(|_| {
                    LedgerError::InvalidTransaction("hash memo must be 32 bytes".to_string())
                })?;
                Ok(Memo::Hash(hash))
            }
            other => Err(LedgerError::InvalidTransaction(format!(
                "unknown memo type {:?}",
                other
            ))),
        }
    }

    /// Stored value and type of this memo, `None` when empty
    pub fn to_parts(&self) -> Option<(String, &'static str)> {
        match self {
            Memo::None => None,
            Memo::Text(text) => Some((text.clone(), "text")),
            Memo::Id(id) => Some((id.to_string(), "id")),
            Memo::Hash(hash) => Some((hex::encode(hash), "hash")),
        }
    }
}

/// Validity window of a transaction, in unix seconds. Zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    /// Earliest close time
    pub min_time: i64,
    /// Latest close time
    pub max_time: i64,
}

impl TimeBounds {
    /// Window that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            min_time: 0,
            max_time: chrono::Utc::now().timestamp() + timeout.as_secs() as i64,
        }
    }

    /// Whether `now` falls inside the window
    pub fn contains(&self, now: i64) -> bool {
        (self.min_time == 0 || now >= self.min_time) && (self.max_time == 0 || now <= self.max_time)
    }
}

/// Operation body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationBody {
    /// Source account starts paying the reserves of `sponsored_id`
    BeginSponsoringFutureReserves {
        /// Account being sponsored
        sponsored_id: String,
    },
    /// Sponsored account (operation source) accepts the sponsorship
    EndSponsoringFutureReserves,
    /// Create and fund a new account
    CreateAccount {
        /// New account address
        destination: String,
        /// Native balance transferred to it
        starting_balance: Decimal,
    },
    /// Transfer an asset
    Payment {
        /// Receiving account
        destination: String,
        /// Asset sent
        asset: Asset,
        /// Amount sent
        amount: Decimal,
    },
    /// Sponsor stops paying the reserves of `account_id`
    RevokeAccountSponsorship {
        /// Account whose sponsorship is revoked
        account_id: String,
    },
    /// Delete the source account and send its native balance to `destination`
    AccountMerge {
        /// Receiving account
        destination: String,
    },
}

/// Transaction operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation source, defaults to the transaction source
    pub source_account: Option<String>,
    /// Operation body
    pub body: OperationBody,
}

impl Operation {
    /// Operation using the transaction source account
    pub fn new(body: OperationBody) -> Self {
        Self {
            source_account: None,
            body,
        }
    }

    /// Operation with an explicit source account
    pub fn with_source(source: impl Into<String>, body: OperationBody) -> Self {
        Self {
            source_account: Some(source.into()),
            body,
        }
    }
}

/// Unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Account whose sequence number is consumed
    pub source_account: String,
    /// Sequence number, one above the source account's current sequence
    pub sequence: i64,
    /// Total fee, in stroops
    pub fee: u32,
    /// Operations, applied atomically
    pub operations: Vec<Operation>,
    /// Memo
    pub memo: Memo,
    /// Validity window
    pub time_bounds: Option<TimeBounds>,
}

impl Transaction {
    /// New transaction consuming `sequence` from `source_account`
    pub fn new(source_account: impl Into<String>, sequence: i64) -> Self {
        Self {
            source_account: source_account.into(),
            sequence,
            fee: 0,
            operations: Vec::new(),
            memo: Memo::None,
            time_bounds: None,
        }
    }

    /// Append an operation
    pub fn add_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Set the memo
    pub fn with_memo(mut self, memo: Memo) -> Self {
        self.memo = memo;
        self
    }

    /// Expire the transaction `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.time_bounds = Some(TimeBounds::with_timeout(timeout));
        self
    }

    /// Check operation limits and set the fee to `base_fee` per operation
    pub fn build(mut self, base_fee: u32) -> Result<Self> {
        if self.operations.is_empty() {
            return Err(LedgerError::InvalidTransaction(
                "transaction has no operations".to_string(),
            ));
        }
        if self.operations.len() > MAX_OPERATIONS_PER_TX {
            return Err(LedgerError::InvalidTransaction(format!(
                "transaction has {} operations, maximum is {}",
                self.operations.len(),
                MAX_OPERATIONS_PER_TX
            )));
        }

        self.fee = base_fee.saturating_mul(self.operations.len() as u32);
        Ok(self)
    }

    /// Hash that signers sign
    pub fn hash(&self, network_passphrase: &str) -> Result<[u8; 32]> {
        signature_base(network_passphrase, b"tx", &bincode::serialize(self)?)
    }

    /// Every account whose signature the ledger requires
    pub fn required_signers(&self) -> Vec<String> {
        let mut signers = vec![self.source_account.clone()];
        for op in &self.operations {
            if let Some(source) = &op.source_account {
                if !signers.contains(source) {
                    signers.push(source.clone());
                }
            }
        }
        signers
    }
}

/// Signature tagged with the signing account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoratedSignature {
    /// Signing account address
    pub signer: String,
    /// Hex-encoded signature
    pub signature: String,
}

impl DecoratedSignature {
    /// Sign a transaction hash with a key pair
    pub fn sign(keypair: &KeyPair, hash: &[u8; 32]) -> Self {
        Self {
            signer: keypair.address(),
            signature: hex::encode(keypair.sign(hash)),
        }
    }

    /// Verify against a transaction hash
    pub fn verify(&self, hash: &[u8; 32]) -> bool {
        hex::decode(&self.signature)
            .map(|bytes| crate::keys::verify_signature(&self.signer, hash, &bytes))
            .unwrap_or(false)
    }
}

/// Transaction plus signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Transaction body
    pub transaction: Transaction,
    /// Collected signatures
    pub signatures: Vec<DecoratedSignature>,
}

impl SignedTransaction {
    /// Wrap an unsigned transaction
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            signatures: Vec::new(),
        }
    }

    /// Hash of the transaction body
    pub fn hash(&self, network_passphrase: &str) -> Result<[u8; 32]> {
        self.transaction.hash(network_passphrase)
    }

    /// Hex hash, as reported by the ledger
    pub fn hash_hex(&self, network_passphrase: &str) -> Result<String> {
        self.hash(network_passphrase).map(hex::encode)
    }
}

/// Fee bump: a fee source pays the fee of an already-signed inner transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBumpTransaction {
    /// Account paying the fee
    pub fee_source: String,
    /// Maximum fee, in stroops
    pub max_fee: u32,
    /// Signed inner transaction
    pub inner: SignedTransaction,
}

impl FeeBumpTransaction {
    /// Wrap a signed transaction
    pub fn new(fee_source: impl Into<String>, max_fee: u32, inner: SignedTransaction) -> Self {
        Self {
            fee_source: fee_source.into(),
            max_fee,
            inner,
        }
    }

    /// Hash that the fee source signs
    pub fn hash(&self, network_passphrase: &str) -> Result<[u8; 32]> {
        signature_base(network_passphrase, b"fee_bump", &bincode::serialize(self)?)
    }
}

/// Fee bump plus the fee source signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedFeeBumpTransaction {
    /// Fee bump body
    pub fee_bump: FeeBumpTransaction,
    /// Fee source signatures
    pub signatures: Vec<DecoratedSignature>,
}

/// Anything the ledger accepts for submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "envelope", rename_all = "snake_case")]
pub enum TransactionEnvelope {
    /// Plain signed transaction
    Transaction(SignedTransaction),
    /// Fee-bumped transaction
    FeeBump(SignedFeeBumpTransaction),
}

impl TransactionEnvelope {
    /// Hex hash the ledger will report for this envelope
    pub fn hash_hex(&self, network_passphrase: &str) -> Result<String> {
        let hash = match self {
            TransactionEnvelope::Transaction(tx) => tx.hash(network_passphrase)?,
            TransactionEnvelope::FeeBump(fb) => fb.fee_bump.hash(network_passphrase)?,
        };
        Ok(hex::encode(hash))
    }

    /// Inner transaction
    pub fn transaction(&self) -> &Transaction {
        match self {
            TransactionEnvelope::Transaction(tx) => &tx.transaction,
            TransactionEnvelope::FeeBump(fb) => &fb.fee_bump.inner.transaction,
        }
    }
}

fn signature_base(network_passphrase: &str, tag: &[u8], body: &[u8]) -> Result<[u8; 32]> {
    let network_id = Sha256::digest(network_passphrase.as_bytes());

    let mut hasher = Sha256::new();
    hasher.update(network_id);
    hasher.update(tag);
    hasher.update(body);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    fn payment_tx() -> Transaction {
        Transaction::new("source", 42).add_operation(Operation::new(OperationBody::Payment {
            destination: "dest".to_string(),
            asset: Asset::credit("USDC", "issuer"),
            amount: dec("100.0000000"),
        }))
    }

    #[test]
    fn test_hash_depends_on_network() {
        let tx = payment_tx().build(BASE_FEE).unwrap();
        assert_ne!(
            tx.hash(PASSPHRASE).unwrap(),
            tx.hash("Public Global Stellar Network ; September 2015").unwrap()
        );
        assert_eq!(tx.hash(PASSPHRASE).unwrap(), tx.hash(PASSPHRASE).unwrap());
    }

    #[test]
    fn test_build_sets_fee_and_rejects_empty() {
        let tx = payment_tx().build(BASE_FEE).unwrap();
        assert_eq!(tx.fee, BASE_FEE);

        let empty = Transaction::new("source", 1).build(BASE_FEE);
        assert!(matches!(empty, Err(LedgerError::InvalidTransaction(_))));
    }

    #[test]
    fn test_required_signers_include_operation_sources() {
        let tx = Transaction::new("host", 1)
            .add_operation(Operation::new(OperationBody::BeginSponsoringFutureReserves {
                sponsored_id: "channel".to_string(),
            }))
            .add_operation(Operation::with_source(
                "channel",
                OperationBody::EndSponsoringFutureReserves,
            ));

        assert_eq!(tx.required_signers(), vec!["host".to_string(), "channel".to_string()]);
    }

    #[test]
    fn test_signature_verifies_against_hash() {
        let keypair = KeyPair::generate();
        let hash = payment_tx().hash(PASSPHRASE).unwrap();
        let signature = DecoratedSignature::sign(&keypair, &hash);
        assert!(signature.verify(&hash));
        assert!(!signature.verify(&[0u8; 32]));
    }

    #[test]
    fn test_memo_parsing() {
        assert_eq!(Memo::parse("", "text").unwrap(), Memo::None);
        assert_eq!(Memo::parse("12345", "id").unwrap(), Memo::Id(12345));
        assert!(Memo::parse("abc", "id").is_err());
        assert!(Memo::text("x".repeat(29)).is_err());
        assert!(Memo::parse("hello", "carrier-pigeon").is_err());
    }

    #[test]
    fn test_native_asset_from_parts() {
        assert!(Asset::from_parts("XLM", "").is_native());
        assert!(!Asset::from_parts("USDC", "issuer").is_native());
    }
}
