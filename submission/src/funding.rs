//! Creating and funding new ledger accounts

use crate::{Result, SubmissionError};
use disbursement_core::{RetryPolicy, TransactionAccount};
use ledger_client::{
    LedgerClient, Operation, OperationBody, Transaction, TransactionEnvelope, BASE_FEE,
};
use rust_decimal::Decimal;
use signing::SignatureService;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CREATE_ACCOUNT_TX_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates accounts funded with native balance
pub struct AccountFunder {
    ledger: Arc<dyn LedgerClient>,
    signatures: Arc<SignatureService>,
    retry_policy: RetryPolicy,
    base_fee: u32,
}

impl AccountFunder {
    /// Create a funder using the account creation retry policy
    pub fn new(ledger: Arc<dyn LedgerClient>, signatures: Arc<SignatureService>) -> Self {
        Self {
            ledger,
            signatures,
            retry_policy: RetryPolicy::create_and_fund_account(),
            base_fee: BASE_FEE,
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Whether a failed attempt is worth another one: anything the ledger did not
    /// reject for good
    fn should_retry(error: &SubmissionError) -> bool {
        match error.ledger_error() {
            Some(e) => !e.is_ledger_error() || !e.is_terminal(),
            None => true,
        }
    }

    /// Create `destination` holding `amount` native, paid by the host account
    pub async fn create_and_fund_account(&self, destination: &str, amount: Decimal) -> Result<()> {
        let source = self.signatures.host_account().clone();
        self.create_and_fund_account_from(&source, destination, amount)
            .await
    }

    /// Create `destination` holding `amount` native, paid by `source`
    pub async fn create_and_fund_account_from(
        &self,
        source: &TransactionAccount,
        destination: &str,
        amount: Decimal,
    ) -> Result<()> {
        if source.address == destination {
            return Err(SubmissionError::InvalidTransaction(format!(
                "funding source account and destination account cannot be the same: {}",
                destination
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(SubmissionError::InvalidTransaction(format!(
                "funding amount must be positive, got {}",
                amount
            )));
        }

        self.retry_policy
            .run("create_and_fund_account", Self::should_retry, |_attempt| {
                self.submit_create_account(source, destination, amount)
            })
            .await?;

        // The account must be visible before anyone uses it.
        self.ledger.account(destination).await?;
        info!(destination, %amount, "Created and funded account");
        Ok(())
    }

    async fn submit_create_account(
        &self,
        source: &TransactionAccount,
        destination: &str,
        amount: Decimal,
    ) -> Result<()> {
        // Sequence is read fresh on every attempt.
        let source_detail = self.ledger.account(&source.address).await?;
        let tx = Transaction::new(source.address.clone(), source_detail.sequence + 1)
            .add_operation(Operation::new(OperationBody::CreateAccount {
                destination: destination.to_string(),
                starting_balance: amount,
            }))
            .with_timeout(CREATE_ACCOUNT_TX_TIMEOUT)
            .build(self.base_fee)?;

        let signed = self
            .signatures
            .router()
            .sign_stellar_transaction(tx, std::slice::from_ref(source))
            .await?;
        self.ledger
            .submit(&TransactionEnvelope::Transaction(signed))
            .await?;
        Ok(())
    }
}
