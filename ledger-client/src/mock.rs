//! In-memory ledger for tests and local runs
//!
//! Applies transactions with the same checks the network performs on the paths this
//! workspace uses: sequence numbers, signatures of every required signer, time bounds,
//! sponsorship bookkeeping and balances. Failures can be scripted ahead of a submission.

use crate::client::{AccountDetail, Balance, LedgerClient, SubmitResponse, TransactionRecord};
use crate::error::ResultCodes;
use crate::transaction::{
    Asset, DecoratedSignature, OperationBody, Transaction, TransactionEnvelope, MAX_SIGNATURES,
};
use crate::{LedgerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Minimum native balance an unsponsored account must hold
const MIN_RESERVE: Decimal = Decimal::ONE;

#[derive(Debug, Clone)]
struct MockAccount {
    sequence: i64,
    balances: HashMap<Asset, Decimal>,
    sponsor: Option<String>,
}

impl MockAccount {
    fn native(&self) -> Decimal {
        self.balances
            .get(&Asset::native())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<String, MockAccount>,
    transactions: HashMap<String, TransactionRecord>,
    ledger: u64,
}

/// In-memory ledger
pub struct MockLedger {
    network_passphrase: String,
    latency: Duration,
    state: Mutex<LedgerState>,
    scripted_failures: Mutex<VecDeque<LedgerError>>,
    submissions: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockLedger {
    /// Create an empty ledger
    pub fn new(network_passphrase: impl Into<String>) -> Self {
        Self {
            network_passphrase: network_passphrase.into(),
            latency: Duration::ZERO,
            state: Mutex::new(LedgerState {
                ledger: 1,
                ..Default::default()
            }),
            scripted_failures: Mutex::new(VecDeque::new()),
            submissions: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every submission by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Create an unsponsored account holding `native_balance`
    pub fn create_account(&self, address: &str, native_balance: Decimal) {
        let mut balances = HashMap::new();
        balances.insert(Asset::native(), native_balance);
        self.state.lock().accounts.insert(
            address.to_string(),
            MockAccount {
                sequence: 0,
                balances,
                sponsor: None,
            },
        );
    }

    /// Add `amount` of `asset` to an existing account
    pub fn credit(&self, address: &str, asset: &Asset, amount: Decimal) {
        if let Some(account) = self.state.lock().accounts.get_mut(address) {
            *account.balances.entry(asset.clone()).or_insert(Decimal::ZERO) += amount;
        }
    }

    /// Fail the next submission with `error` without applying it
    pub fn fail_next_submission(&self, error: LedgerError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Whether the account exists
    pub fn exists(&self, address: &str) -> bool {
        self.state.lock().accounts.contains_key(address)
    }

    /// Balance of `asset` held by `address`
    pub fn balance(&self, address: &str, asset: &Asset) -> Decimal {
        self.state
            .lock()
            .accounts
            .get(address)
            .and_then(|a| a.balances.get(asset).copied())
            .unwrap_or(Decimal::ZERO)
    }

    /// Submissions received, including rejected ones
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Highest number of submissions observed in flight at the same time
    pub fn max_concurrent_submissions(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Hashes of successfully applied transactions
    pub fn applied_hashes(&self) -> Vec<String> {
        self.state.lock().transactions.keys().cloned().collect()
    }

    fn apply(&self, envelope: &TransactionEnvelope) -> Result<SubmitResponse> {
        let hash = envelope.hash_hex(&self.network_passphrase)?;
        let now = chrono::Utc::now().timestamp();

        let (tx, inner_signatures, fee_payer, fee) = match envelope {
            TransactionEnvelope::Transaction(signed) => (
                &signed.transaction,
                &signed.signatures,
                signed.transaction.source_account.clone(),
                signed.transaction.fee,
            ),
            TransactionEnvelope::FeeBump(signed) => {
                let fee_bump = &signed.fee_bump;
                if fee_bump.max_fee < fee_bump.inner.transaction.fee {
                    return Err(reject("tx_insufficient_fee"));
                }
                let fee_hash = fee_bump.hash(&self.network_passphrase)?;
                check_signatures(
                    &signed.signatures,
                    &fee_hash,
                    &[fee_bump.fee_source.clone()],
                )?;
                (
                    &fee_bump.inner.transaction,
                    &fee_bump.inner.signatures,
                    fee_bump.fee_source.clone(),
                    fee_bump.inner.transaction.fee,
                )
            }
        };

        if let Some(bounds) = tx.time_bounds {
            if !bounds.contains(now) {
                return Err(reject("tx_too_late"));
            }
        }

        let inner_hash = tx.hash(&self.network_passphrase)?;
        check_signatures(inner_signatures, &inner_hash, &tx.required_signers())?;

        let mut state = self.state.lock();

        let source = state
            .accounts
            .get(&tx.source_account)
            .ok_or_else(|| reject("tx_no_account"))?;
        if tx.sequence != source.sequence + 1 {
            return Err(reject("tx_bad_seq"));
        }

        let fee_amount = Decimal::new(i64::from(fee), 7);
        let payer = state
            .accounts
            .get(&fee_payer)
            .ok_or_else(|| reject("tx_no_account"))?;
        if payer.native() < fee_amount {
            return Err(reject("tx_insufficient_balance"));
        }

        let mut accounts = state.accounts.clone();
        if let Some(source) = accounts.get_mut(&tx.source_account) {
            source.sequence = tx.sequence;
        }
        if let Some(payer) = accounts.get_mut(&fee_payer) {
            *payer.balances.entry(Asset::native()).or_insert(Decimal::ZERO) -= fee_amount;
        }

        match apply_operations(&mut accounts, tx) {
            Ok(()) => state.accounts = accounts,
            Err(codes) => {
                // A failed transaction still consumes its sequence number and fee.
                if let Some(source) = state.accounts.get_mut(&tx.source_account) {
                    source.sequence = tx.sequence;
                }
                if let Some(payer) = state.accounts.get_mut(&fee_payer) {
                    *payer.balances.entry(Asset::native()).or_insert(Decimal::ZERO) -= fee_amount;
                }
                return Err(LedgerError::Rejected(codes));
            }
        }

        state.ledger += 1;
        let ledger = state.ledger;
        state.transactions.insert(
            hash.clone(),
            TransactionRecord {
                hash: hash.clone(),
                successful: true,
                ledger,
            },
        );

        info!(tx_hash = %hash, ledger, "Mock ledger applied transaction");
        Ok(SubmitResponse { hash, ledger })
    }
}

fn reject(code: &str) -> LedgerError {
    LedgerError::Rejected(ResultCodes::transaction(code))
}

fn check_signatures(
    signatures: &[DecoratedSignature],
    hash: &[u8; 32],
    required: &[String],
) -> Result<()> {
    if signatures.len() > MAX_SIGNATURES {
        return Err(reject("tx_bad_auth_extra"));
    }
    if signatures.iter().any(|s| !s.verify(hash)) {
        return Err(reject("tx_bad_auth"));
    }

    let signers: HashSet<&str> = signatures.iter().map(|s| s.signer.as_str()).collect();
    if required.iter().any(|r| !signers.contains(r.as_str())) {
        return Err(reject("tx_bad_auth"));
    }
    if signers.iter().any(|s| !required.iter().any(|r| r == s)) {
        return Err(reject("tx_bad_auth_extra"));
    }
    Ok(())
}

fn apply_operations(
    accounts: &mut HashMap<String, MockAccount>,
    tx: &Transaction,
) -> std::result::Result<(), ResultCodes> {
    let mut codes: Vec<String> = Vec::with_capacity(tx.operations.len());
    // sponsored account -> sponsor, for sponsorships opened in this transaction
    let mut sponsoring: HashMap<String, String> = HashMap::new();

    for op in &tx.operations {
        let source = op
            .source_account
            .clone()
            .unwrap_or_else(|| tx.source_account.clone());

        let outcome = apply_operation(accounts, &mut sponsoring, &source, &op.body);
        match outcome {
            Ok(()) => codes.push("op_success".to_string()),
            Err(code) => {
                codes.push(code.to_string());
                return Err(ResultCodes::failed_operations(codes));
            }
        }
    }

    if !sponsoring.is_empty() {
        return Err(ResultCodes::transaction("tx_bad_sponsorship"));
    }
    Ok(())
}

fn apply_operation(
    accounts: &mut HashMap<String, MockAccount>,
    sponsoring: &mut HashMap<String, String>,
    source: &str,
    body: &OperationBody,
) -> std::result::Result<(), &'static str> {
    if !accounts.contains_key(source) {
        return Err("op_no_account");
    }

    match body {
        OperationBody::BeginSponsoringFutureReserves { sponsored_id } => {
            if sponsoring.contains_key(sponsored_id) {
                return Err("op_already_sponsored");
            }
            sponsoring.insert(sponsored_id.clone(), source.to_string());
        }
        OperationBody::EndSponsoringFutureReserves => {
            if sponsoring.remove(source).is_none() {
                return Err("op_not_sponsored");
            }
        }
        OperationBody::CreateAccount {
            destination,
            starting_balance,
        } => {
            if accounts.contains_key(destination) {
                return Err("op_already_exists");
            }
            let sponsor = sponsoring.get(destination).cloned();
            if sponsor.is_none() && *starting_balance < MIN_RESERVE {
                return Err("op_low_reserve");
            }
            debit(accounts, source, &Asset::native(), *starting_balance)?;

            let mut balances = HashMap::new();
            balances.insert(Asset::native(), *starting_balance);
            accounts.insert(
                destination.clone(),
                MockAccount {
                    sequence: 0,
                    balances,
                    sponsor,
                },
            );
        }
        OperationBody::Payment {
            destination,
            asset,
            amount,
        } => {
            if *amount <= Decimal::ZERO {
                return Err("op_malformed");
            }
            if !accounts.contains_key(destination) {
                return Err("op_no_destination");
            }
            if asset.issuer.as_deref() != Some(source) {
                debit(accounts, source, asset, *amount)?;
            }
            if let Some(dest) = accounts.get_mut(destination) {
                *dest.balances.entry(asset.clone()).or_insert(Decimal::ZERO) += *amount;
            }
        }
        OperationBody::RevokeAccountSponsorship { account_id } => {
            let account = accounts.get_mut(account_id).ok_or("op_does_not_exist")?;
            if account.sponsor.as_deref() != Some(source) {
                return Err("op_not_sponsor");
            }
            if account.native() < MIN_RESERVE {
                return Err("op_low_reserve");
            }
            account.sponsor = None;
        }
        OperationBody::AccountMerge { destination } => {
            if !accounts.contains_key(destination) {
                return Err("op_no_destination");
            }
            let merged = accounts.get(source).cloned().ok_or("op_no_account")?;
            let has_sub_entries = merged
                .balances
                .iter()
                .any(|(asset, amount)| !asset.is_native() && *amount > Decimal::ZERO);
            if has_sub_entries {
                return Err("op_has_sub_entries");
            }
            accounts.remove(source);
            if let Some(dest) = accounts.get_mut(destination) {
                *dest.balances.entry(Asset::native()).or_insert(Decimal::ZERO) += merged.native();
            }
        }
    }
    Ok(())
}

fn debit(
    accounts: &mut HashMap<String, MockAccount>,
    address: &str,
    asset: &Asset,
    amount: Decimal,
) -> std::result::Result<(), &'static str> {
    let account = accounts.get_mut(address).ok_or("op_no_account")?;
    let balance = account.balances.entry(asset.clone()).or_insert(Decimal::ZERO);
    if *balance < amount {
        return Err("op_underfunded");
    }
    *balance -= amount;
    Ok(())
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    async fn account(&self, address: &str) -> Result<AccountDetail> {
        let state = self.state.lock();
        let account = state
            .accounts
            .get(address)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", address)))?;

        let mut balances: Vec<Balance> = account
            .balances
            .iter()
            .map(|(asset, amount)| Balance {
                asset: asset.clone(),
                amount: *amount,
            })
            .collect();
        balances.sort_by_key(|b| (!b.asset.is_native(), b.asset.code.clone()));

        Ok(AccountDetail {
            address: address.to_string(),
            sequence: account.sequence,
            balances,
            sponsor: account.sponsor.clone(),
        })
    }

    async fn submit(&self, envelope: &TransactionEnvelope) -> Result<SubmitResponse> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.scripted_failures.lock().pop_front();
        let result = match scripted {
            Some(err) => Err(err),
            None => self.apply(envelope),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn transaction(&self, hash: &str) -> Result<TransactionRecord> {
        self.state
            .lock()
            .transactions
            .get(hash)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::transaction::{Operation, SignedTransaction, BASE_FEE};

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    fn sign(tx: Transaction, keys: &[&KeyPair]) -> TransactionEnvelope {
        let hash = tx.hash(PASSPHRASE).unwrap();
        let mut signed = SignedTransaction::new(tx);
        for key in keys {
            signed.signatures.push(DecoratedSignature::sign(key, &hash));
        }
        TransactionEnvelope::Transaction(signed)
    }

    #[tokio::test]
    async fn test_native_payment_applies() {
        let ledger = MockLedger::new(PASSPHRASE);
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        ledger.create_account(&alice.address(), Decimal::from(100));
        ledger.create_account(&bob.address(), Decimal::from(1));

        let tx = Transaction::new(alice.address(), 1)
            .add_operation(Operation::new(OperationBody::Payment {
                destination: bob.address(),
                asset: Asset::native(),
                amount: Decimal::from(10),
            }))
            .build(BASE_FEE)
            .unwrap();

        let response = ledger.submit(&sign(tx, &[&alice])).await.unwrap();
        assert_eq!(ledger.balance(&bob.address(), &Asset::native()), Decimal::from(11));
        assert!(ledger.transaction(&response.hash).await.unwrap().successful);
    }

    #[tokio::test]
    async fn test_stale_sequence_rejected() {
        let ledger = MockLedger::new(PASSPHRASE);
        let alice = KeyPair::generate();
        ledger.create_account(&alice.address(), Decimal::from(100));

        let tx = Transaction::new(alice.address(), 5)
            .add_operation(Operation::new(OperationBody::Payment {
                destination: alice.address(),
                asset: Asset::native(),
                amount: Decimal::ONE,
            }))
            .build(BASE_FEE)
            .unwrap();

        let err = ledger.submit(&sign(tx, &[&alice])).await.unwrap_err();
        assert!(err.is_bad_sequence());
    }

    #[tokio::test]
    async fn test_missing_signature_rejected() {
        let ledger = MockLedger::new(PASSPHRASE);
        let host = KeyPair::generate();
        let channel = KeyPair::generate();
        ledger.create_account(&host.address(), Decimal::from(100));

        let tx = Transaction::new(host.address(), 1)
            .add_operation(Operation::new(OperationBody::BeginSponsoringFutureReserves {
                sponsored_id: channel.address(),
            }))
            .add_operation(Operation::new(OperationBody::CreateAccount {
                destination: channel.address(),
                starting_balance: Decimal::ZERO,
            }))
            .add_operation(Operation::with_source(
                channel.address(),
                OperationBody::EndSponsoringFutureReserves,
            ))
            .build(BASE_FEE)
            .unwrap();

        let err = ledger.submit(&sign(tx.clone(), &[&host])).await.unwrap_err();
        assert!(err.is_terminal());

        ledger.submit(&sign(tx, &[&host, &channel])).await.unwrap();
        let detail = ledger.account(&channel.address()).await.unwrap();
        assert_eq!(detail.sponsor, Some(host.address()));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_not_applied() {
        let ledger = MockLedger::new(PASSPHRASE);
        let alice = KeyPair::generate();
        ledger.create_account(&alice.address(), Decimal::from(100));
        ledger.fail_next_submission(LedgerError::Timeout);

        let tx = Transaction::new(alice.address(), 1)
            .add_operation(Operation::new(OperationBody::Payment {
                destination: alice.address(),
                asset: Asset::native(),
                amount: Decimal::ONE,
            }))
            .build(BASE_FEE)
            .unwrap();

        assert!(matches!(
            ledger.submit(&sign(tx, &[&alice])).await,
            Err(LedgerError::Timeout)
        ));
        assert_eq!(ledger.account(&alice.address()).await.unwrap().sequence, 0);
        assert_eq!(ledger.submission_count(), 1);
    }
}
