//! Transaction worker
//!
//! Each pass claims pending submitter transactions (bounded by the processing limit and
//! the channel account pool), and for each one: leases a channel account, builds the
//! payment with the channel account as sequence source and the tenant's distribution
//! account as payment source, signs it, wraps it in a fee bump paid by the distribution
//! account, records the hash, submits, and persists the outcome.
//!
//! A submission without a definite answer may still be applied later. Such rows stay
//! locked until the time bounds of their signed attempt have passed; only then is the
//! recorded hash looked up and, if it never landed, a new transaction built.

use crate::channel_account::ChannelAccountPool;
use crate::limiter::ProcessingLimiter;
use crate::metrics::{TRANSACTIONS_PROCESSED, TRANSACTION_PROCESSING_DURATION};
use crate::store::{SubmitterTransaction, SubmitterTransactionStore};
use crate::{Result, SubmissionError};
use disbursement_core::{
    PaymentStatus, Platform, RequestContext, RetryPolicy, TenantManager, TransactionAccount,
};
use ledger_client::{
    Asset, FeeBumpTransaction, LedgerClient, LedgerError, Memo, Operation, OperationBody,
    SubmitResponse, Transaction, TransactionEnvelope, BASE_FEE,
};
use message_bus::{
    EventPaymentCompletedData, Message, Producer, PAYMENT_COMPLETED_ERROR_TYPE,
    PAYMENT_COMPLETED_SUCCESS_TYPE, PAYMENT_COMPLETED_TOPIC,
};
use signing::SignatureService;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Worker settings
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Sleep between passes that found nothing to do
    pub poll_interval: Duration,
    /// Worker passes a row gets before retryable failures become final
    pub max_attempts: u32,
    /// Fee per operation of the payment transaction
    pub base_fee: u32,
    /// Highest fee per operation the distribution account pays in the fee bump
    pub max_base_fee: u32,
    /// Validity window of each signed transaction
    pub transaction_timeout: Duration,
    /// Added to the end of the validity window before an unanswered attempt is given up on
    pub ledger_close_grace: Duration,
    /// Rows processing for longer than this at startup are returned to pending
    pub stuck_processing_timeout: Duration,
    /// Resubmission of one signed transaction within a pass
    pub retry_policy: RetryPolicy,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 5,
            base_fee: BASE_FEE,
            max_base_fee: 10_000,
            transaction_timeout: Duration::from_secs(300),
            ledger_close_grace: Duration::from_secs(30),
            stuck_processing_timeout: Duration::from_secs(5 * 60),
            retry_policy: RetryPolicy::submission(),
        }
    }
}

/// How a pass over one row ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Success(String),
    Failed(String),
    Retry(String),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failed(_) => "error",
            Outcome::Retry(_) => "retry",
        }
    }
}

/// Classify a failed pass: terminal ledger rejections and configuration problems are
/// final, anything transient gets another pass.
fn classify(error: &SubmissionError) -> Outcome {
    if let Some(ledger_error) = error.ledger_error() {
        return if ledger_error.is_retryable() {
            Outcome::Retry(ledger_error.to_string())
        } else {
            Outcome::Failed(ledger_error.to_string())
        };
    }

    match error {
        SubmissionError::AttemptInFlight { .. }
        | SubmissionError::Database(_)
        | SubmissionError::Bus(_)
        | SubmissionError::NoChannelAccountsAvailable => Outcome::Retry(error.to_string()),
        _ => Outcome::Failed(error.to_string()),
    }
}

/// Failures worth resubmitting the same signed envelope for. Rejections with result
/// codes need a rebuilt transaction and end the pass instead.
fn should_resubmit(error: &SubmissionError) -> bool {
    error
        .ledger_error()
        .map_or(false, |e| e.is_retryable() && e.result_codes().is_none())
}

/// Submission failures after which the envelope may still have been applied
fn may_have_landed(error: &SubmissionError) -> bool {
    error.ledger_error().map_or(false, |e| {
        e.is_indeterminate() || matches!(e, LedgerError::Http { status, .. } if *status >= 500)
    })
}

/// Claims and processes submitter transactions
pub struct TransactionWorker {
    store: Arc<dyn SubmitterTransactionStore>,
    ledger: Arc<dyn LedgerClient>,
    signatures: Arc<SignatureService>,
    pool: Arc<ChannelAccountPool>,
    tenants: Arc<dyn TenantManager>,
    producer: Option<Arc<dyn Producer>>,
    limiter: Arc<ProcessingLimiter>,
    config: SubmitterConfig,
}

impl TransactionWorker {
    /// Create a worker
    pub fn new(
        store: Arc<dyn SubmitterTransactionStore>,
        ledger: Arc<dyn LedgerClient>,
        signatures: Arc<SignatureService>,
        pool: Arc<ChannelAccountPool>,
        tenants: Arc<dyn TenantManager>,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            signatures,
            pool,
            tenants,
            producer: None,
            limiter: Arc::new(ProcessingLimiter::default()),
            config,
        }
    }

    /// Publish completion events through `producer`
    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Share a processing limiter
    pub fn with_limiter(mut self, limiter: Arc<ProcessingLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Process passes until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self
            .store
            .reset_stuck_processing(self.config.stuck_processing_timeout)
            .await
        {
            Ok(reset) if reset > 0 => warn!(reset, "Recovered submitter transactions left processing"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to recover stuck submitter transactions"),
        }

        info!(channel_accounts = self.pool.size(), "Transaction worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = match self.process_pending().await {
                Ok(processed) => processed,
                Err(e) => {
                    error!(error = %e, "Transaction worker pass failed");
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!("Transaction worker stopped");
    }

    /// Claim one batch and process it concurrently, one channel account per row.
    /// Returns the number of rows processed.
    pub async fn process_pending(&self) -> Result<usize> {
        let channel_accounts = self.pool.size();
        if channel_accounts == 0 {
            warn!("No channel accounts available, skipping pass");
            return Ok(0);
        }

        let limit = self.limiter.limit().min(channel_accounts);
        let claimed = self.store.claim_pending(limit).await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(claimed = claimed.len(), limit, "Claimed submitter transactions");
        let processed = claimed.len();
        futures::future::join_all(claimed.into_iter().map(|tx| self.process_transaction(tx)))
            .await;
        Ok(processed)
    }

    async fn process_transaction(&self, tx: SubmitterTransaction) {
        let start = Instant::now();
        let mut in_flight = None;
        let outcome = match self.attempt(&tx, &mut in_flight).await {
            Ok(response) => Outcome::Success(response.hash),
            Err(e) => {
                if let Some(ledger_error) = e.ledger_error() {
                    self.limiter.record(ledger_error);
                }
                classify(&e)
            }
        };

        TRANSACTIONS_PROCESSED
            .with_label_values(&[outcome.label()])
            .inc();
        TRANSACTION_PROCESSING_DURATION
            .with_label_values(&[outcome.label()])
            .observe(start.elapsed().as_secs_f64());

        if let Err(e) = self.persist(&tx, outcome, in_flight).await {
            error!(transaction_id = %tx.id, payment_id = %tx.external_id, error = %e, "Failed to persist submission outcome");
        }
    }

    /// One pass over a row. `in_flight` is set to the attempt's deadline when the pass
    /// ends while a signed envelope of this row may still be applied.
    async fn attempt(
        &self,
        tx: &SubmitterTransaction,
        in_flight: &mut Option<DateTime<Utc>>,
    ) -> Result<SubmitResponse> {
        if let Some(until) = tx.locked_until.filter(|until| *until > Utc::now()) {
            if tx.stellar_transaction_hash.is_some() {
                *in_flight = Some(until);
                return Err(SubmissionError::AttemptInFlight {
                    id: tx.id.clone(),
                    until,
                });
            }
        }

        match self.previous_attempt_applied(tx).await {
            Ok(Some(response)) => return Ok(response),
            Ok(None) => {}
            Err(e) => {
                // Unknown whether the recorded hash landed; keep the row alive.
                *in_flight = Some(tx.locked_until.unwrap_or_else(Utc::now));
                return Err(e);
            }
        }

        let distribution = self.distribution_account(&tx.tenant_id).await?;
        let lease = self.pool.lease().await?;

        let (envelope, valid_until) = self
            .build_envelope(tx, lease.address(), &distribution)
            .await?;
        let hash = envelope.hash_hex(self.signatures.network_passphrase())?;
        let locked_until = valid_until
            + chrono::Duration::from_std(self.config.ledger_close_grace)
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.store
            .record_attempt(&tx.id, &hash, lease.address(), locked_until)
            .await?;

        debug!(transaction_id = %tx.id, tx_hash = %hash, channel_account = %lease.address(), "Submitting payment");
        let ledger = &self.ledger;
        let envelope = &envelope;
        let unanswered = &AtomicBool::new(false);
        let result = self
            .config
            .retry_policy
            .run("submit_payment", should_resubmit, |_attempt| async move {
                let result = ledger.submit(envelope).await.map_err(SubmissionError::from);
                if let Err(e) = &result {
                    if may_have_landed(e) {
                        unanswered.store(true, Ordering::SeqCst);
                    }
                }
                result
            })
            .await;

        if result.is_err() && unanswered.load(Ordering::SeqCst) {
            *in_flight = Some(locked_until);
        }
        result
    }

    /// A row claimed again may already be on the ledger from an earlier pass whose
    /// outcome was never learned.
    async fn previous_attempt_applied(
        &self,
        tx: &SubmitterTransaction,
    ) -> Result<Option<SubmitResponse>> {
        let Some(hash) = tx.stellar_transaction_hash.as_deref() else {
            return Ok(None);
        };

        match self.ledger.transaction(hash).await {
            Ok(record) if record.successful => {
                info!(transaction_id = %tx.id, tx_hash = %hash, "Previous attempt was applied");
                Ok(Some(SubmitResponse {
                    hash: record.hash,
                    ledger: record.ledger,
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn distribution_account(&self, tenant_id: &str) -> Result<TransactionAccount> {
        let tenant = self.tenants.get_tenant_by_id(tenant_id).await?;
        let ctx = RequestContext::for_tenant(Arc::new(tenant));
        let account = self
            .signatures
            .distribution_resolver()
            .distribution_account_from_context(&ctx)
            .await?;

        if account.platform() != Platform::Stellar {
            return Err(SubmissionError::InvalidTransaction(format!(
                "distribution account of tenant {} is not a ledger account",
                tenant_id
            )));
        }
        Ok(account)
    }

    async fn build_envelope(
        &self,
        tx: &SubmitterTransaction,
        channel_account: &str,
        distribution: &TransactionAccount,
    ) -> Result<(TransactionEnvelope, DateTime<Utc>)> {
        let memo = match (&tx.memo, &tx.memo_type) {
            (Some(value), Some(memo_type)) => Memo::parse(value, memo_type)?,
            (Some(value), None) => Memo::text(value.clone())?,
            _ => Memo::None,
        };

        let channel_detail = self.ledger.account(channel_account).await?;
        let payment = Transaction::new(channel_account, channel_detail.sequence + 1)
            .add_operation(Operation::with_source(
                distribution.address.clone(),
                OperationBody::Payment {
                    destination: tx.destination.clone(),
                    asset: Asset::from_parts(&tx.asset_code, &tx.asset_issuer),
                    amount: tx.amount,
                },
            ))
            .with_memo(memo)
            .with_timeout(self.config.transaction_timeout)
            .build(self.config.base_fee)?;
        let valid_until = payment
            .time_bounds
            .and_then(|bounds| Utc.timestamp_opt(bounds.max_time, 0).single())
            .unwrap_or_else(|| {
                Utc::now()
                    + chrono::Duration::from_std(self.config.transaction_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero())
            });

        let router = self.signatures.router();
        let inner = router
            .sign_stellar_transaction(
                payment,
                &[TransactionAccount::channel(channel_account), distribution.clone()],
            )
            .await?;

        let max_fee = self
            .config
            .max_base_fee
            .max(self.config.base_fee)
            .saturating_mul(inner.transaction.operations.len() as u32 + 1);
        let fee_bump = router
            .sign_fee_bump_stellar_transaction(
                FeeBumpTransaction::new(distribution.address.clone(), max_fee, inner),
                std::slice::from_ref(distribution),
            )
            .await?;
        Ok((TransactionEnvelope::FeeBump(fee_bump), valid_until))
    }

    async fn persist(
        &self,
        tx: &SubmitterTransaction,
        outcome: Outcome,
        in_flight: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match outcome {
            Outcome::Success(hash) => {
                let stored = self.store.mark_success(&tx.id, &hash).await?;
                info!(transaction_id = %tx.id, payment_id = %tx.external_id, tx_hash = %hash, "Payment submitted");
                self.publish_completion(&stored, PaymentStatus::Success).await;
            }
            Outcome::Retry(message) | Outcome::Failed(message) if in_flight.is_some() => {
                // Never failed while the last envelope can still land.
                self.store
                    .release_for_retry(&tx.id, &message, in_flight)
                    .await?;
                info!(transaction_id = %tx.id, locked_until = ?in_flight, reason = %message, "Payment outcome unknown, waiting for its time bounds");
            }
            Outcome::Failed(message) => {
                let stored = self.store.mark_error(&tx.id, &message).await?;
                warn!(transaction_id = %tx.id, payment_id = %tx.external_id, reason = %message, "Payment failed");
                self.publish_completion(&stored, PaymentStatus::Failed).await;
            }
            Outcome::Retry(message) if tx.attempts >= self.config.max_attempts => {
                let message = format!("giving up after {} attempts: {}", tx.attempts, message);
                let stored = self.store.mark_error(&tx.id, &message).await?;
                warn!(transaction_id = %tx.id, payment_id = %tx.external_id, reason = %message, "Payment failed");
                self.publish_completion(&stored, PaymentStatus::Failed).await;
            }
            Outcome::Retry(message) => {
                self.store.release_for_retry(&tx.id, &message, None).await?;
                info!(transaction_id = %tx.id, attempts = tx.attempts, reason = %message, "Payment will be retried");
            }
        }
        Ok(())
    }

    async fn publish_completion(&self, tx: &SubmitterTransaction, status: PaymentStatus) {
        let Some(producer) = &self.producer else {
            warn!(payment_id = %tx.external_id, "No event producer, completion event not published");
            return;
        };

        let event_type = if status == PaymentStatus::Success {
            PAYMENT_COMPLETED_SUCCESS_TYPE
        } else {
            PAYMENT_COMPLETED_ERROR_TYPE
        };
        let data = EventPaymentCompletedData {
            transaction_id: tx.id.clone(),
            payment_id: tx.external_id.clone(),
            payment_status: status.as_str().to_string(),
            payment_status_message: tx.status_message.clone().unwrap_or_default(),
            payment_completed_at: tx.completed_at.unwrap_or_else(chrono::Utc::now),
            stellar_transaction_id: tx.stellar_transaction_hash.clone().unwrap_or_default(),
        };

        let result = match Message::new(
            PAYMENT_COMPLETED_TOPIC,
            tx.external_id.as_str(),
            tx.tenant_id.as_str(),
            event_type,
            &data,
        ) {
            Ok(message) => producer.write_messages(&[message]).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(payment_id = %tx.external_id, error = %e, "Failed to publish payment completed event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_client::ResultCodes;

    #[test]
    fn test_classify() {
        let terminal = SubmissionError::Ledger(LedgerError::Rejected(ResultCodes::failed_operations(
            ["op_no_destination"],
        )));
        assert!(matches!(classify(&terminal), Outcome::Failed(_)));

        let stale = SubmissionError::Ledger(LedgerError::Rejected(ResultCodes::transaction("tx_bad_seq")));
        assert!(matches!(classify(&stale), Outcome::Retry(_)));
        assert!(!should_resubmit(&stale));

        let timeout = SubmissionError::Ledger(LedgerError::Timeout);
        assert!(matches!(classify(&timeout), Outcome::Retry(_)));
        assert!(should_resubmit(&timeout));

        let config = SubmissionError::InvalidTransaction("no ledger account".to_string());
        assert!(matches!(classify(&config), Outcome::Failed(_)));

        let in_flight = SubmissionError::AttemptInFlight {
            id: "tx-1".to_string(),
            until: Utc::now(),
        };
        assert!(matches!(classify(&in_flight), Outcome::Retry(_)));
    }

    #[test]
    fn test_may_have_landed() {
        assert!(may_have_landed(&SubmissionError::Ledger(LedgerError::Timeout)));
        assert!(may_have_landed(&SubmissionError::Ledger(LedgerError::Http {
            status: 500,
            detail: "internal".to_string(),
        })));
        assert!(!may_have_landed(&SubmissionError::Ledger(LedgerError::Http {
            status: 429,
            detail: "slow down".to_string(),
        })));
        assert!(!may_have_landed(&SubmissionError::Ledger(LedgerError::Rejected(
            ResultCodes::transaction("tx_bad_seq")
        ))));
        assert!(!may_have_landed(&SubmissionError::NoChannelAccountsAvailable));
    }
}
