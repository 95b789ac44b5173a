//! Submitter transactions and their store
//!
//! A submitter transaction is one attempt at paying out one payment on the ledger. Rows
//! move `Pending → Processing → {Success, Error}`; a processing row may also go back to
//! `Pending` when its retryable failures ran out within one worker pass. Error rows are
//! final: paying the payment again appends a new row.

use crate::{Result, SubmissionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use disbursement_core::string_enum;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

string_enum! {
    /// Submitter transaction lifecycle
    pub enum TransactionStatus {
        /// Waiting for a worker
        Pending => "PENDING",
        /// Claimed by a worker
        Processing => "PROCESSING",
        /// Confirmed on the ledger
        Success => "SUCCESS",
        /// Failed for good
        Error => "ERROR",
    }
}

impl TransactionStatus {
    /// Whether the row can still change
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Error)
    }

    /// Whether `next` may follow this status
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Success) | (Processing, Error) | (Processing, Pending)
        )
    }
}

/// One ledger payment attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitterTransaction {
    /// Row id
    pub id: String,
    /// Payment id
    pub external_id: String,
    /// Tenant owning the payment
    pub tenant_id: String,
    /// Lifecycle status
    pub status: TransactionStatus,
    /// Asset code
    pub asset_code: String,
    /// Asset issuer, empty for the native asset
    pub asset_issuer: String,
    /// Amount, seven decimal places
    pub amount: Decimal,
    /// Receiver address
    pub destination: String,
    /// Memo value
    pub memo: Option<String>,
    /// Memo type (`text`, `id` or `hash`)
    pub memo_type: Option<String>,
    /// Hash of the last signed attempt
    pub stellar_transaction_hash: Option<String>,
    /// Worker passes that claimed this row
    pub attempts: u32,
    /// Channel account used by the last attempt
    pub channel_account: Option<String>,
    /// The last submitted attempt may still be applied until then; the row is not
    /// claimed again before it passes
    pub locked_until: Option<DateTime<Utc>>,
    /// Failure reason
    pub status_message: Option<String>,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// When the current worker pass claimed it
    pub processing_started_at: Option<DateTime<Utc>>,
    /// When it reached a final status
    pub completed_at: Option<DateTime<Utc>>,
}

/// Row to queue for a payment
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmitterTransaction {
    /// Payment id
    pub external_id: String,
    /// Tenant owning the payment
    pub tenant_id: String,
    /// Asset code
    pub asset_code: String,
    /// Asset issuer, empty for the native asset
    pub asset_issuer: String,
    /// Amount
    pub amount: Decimal,
    /// Receiver address
    pub destination: String,
    /// Memo value
    pub memo: Option<String>,
    /// Memo type
    pub memo_type: Option<String>,
}

impl NewSubmitterTransaction {
    fn into_pending(self) -> SubmitterTransaction {
        let now = Utc::now();
        SubmitterTransaction {
            id: Uuid::new_v4().to_string(),
            external_id: self.external_id,
            tenant_id: self.tenant_id,
            status: TransactionStatus::Pending,
            asset_code: self.asset_code,
            asset_issuer: self.asset_issuer,
            amount: self.amount.round_dp(7),
            destination: self.destination,
            memo: self.memo,
            memo_type: self.memo_type,
            stellar_transaction_hash: None,
            attempts: 0,
            channel_account: None,
            locked_until: None,
            status_message: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            completed_at: None,
        }
    }
}

/// Persistence for submitter transactions
#[async_trait]
pub trait SubmitterTransactionStore: Send + Sync {
    /// For each payment, return its live row (pending, processing or successful) or
    /// append a new pending one. Output order follows input order.
    async fn bulk_get_or_insert(
        &self,
        transactions: &[NewSubmitterTransaction],
    ) -> Result<Vec<SubmitterTransaction>>;

    /// Row by id
    async fn get(&self, id: &str) -> Result<SubmitterTransaction>;

    /// Every row of a payment, oldest first
    async fn list_by_external_id(&self, external_id: &str) -> Result<Vec<SubmitterTransaction>>;

    /// Move up to `limit` pending rows whose lock has passed to processing and return
    /// them. Rows claimed by one caller are never returned to another.
    async fn claim_pending(&self, limit: usize) -> Result<Vec<SubmitterTransaction>>;

    /// Remember the signed attempt before it is submitted, with the time after which the
    /// ledger can no longer apply it
    async fn record_attempt(
        &self,
        id: &str,
        hash: &str,
        channel_account: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<()>;

    /// Processing → success
    async fn mark_success(&self, id: &str, hash: &str) -> Result<SubmitterTransaction>;

    /// Processing → error
    async fn mark_error(&self, id: &str, message: &str) -> Result<SubmitterTransaction>;

    /// Processing → pending, for another worker pass. `locked_until` keeps the row from
    /// being claimed while its last attempt may still land; `None` clears the lock.
    async fn release_for_retry(
        &self,
        id: &str,
        message: &str,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<SubmitterTransaction>;

    /// Return rows stuck in processing for longer than `older_than` to pending
    async fn reset_stuck_processing(&self, older_than: Duration) -> Result<usize>;
}

const COLUMNS: &str = "id, external_id, tenant_id, status, asset_code, asset_issuer, amount, \
     destination, memo, memo_type, stellar_transaction_hash, attempts, channel_account, \
     locked_until, status_message, created_at, updated_at, processing_started_at, completed_at";

const LIVE_STATUSES: &str = "('PENDING', 'PROCESSING', 'SUCCESS')";

fn from_row(row: &PgRow) -> Result<SubmitterTransaction> {
    let status: String = row.try_get("status")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(SubmitterTransaction {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: TransactionStatus::from_str(&status)?,
        asset_code: row.try_get("asset_code")?,
        asset_issuer: row.try_get("asset_issuer")?,
        amount: row.try_get("amount")?,
        destination: row.try_get("destination")?,
        memo: row.try_get("memo")?,
        memo_type: row.try_get("memo_type")?,
        stellar_transaction_hash: row.try_get("stellar_transaction_hash")?,
        attempts: attempts.max(0) as u32,
        channel_account: row.try_get("channel_account")?,
        locked_until: row.try_get("locked_until")?,
        status_message: row.try_get("status_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Submitter transactions in Postgres
pub struct PgSubmitterTransactionStore {
    db_pool: Arc<PgPool>,
}

impl PgSubmitterTransactionStore {
    /// Create a store
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    async fn finish(
        &self,
        id: &str,
        to: TransactionStatus,
        hash: Option<&str>,
        message: Option<&str>,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<SubmitterTransaction> {
        let completed = if to.is_final() { "NOW()" } else { "NULL" };
        let query = format!(
            "UPDATE submitter_transactions \
             SET status = $2, \
                 stellar_transaction_hash = COALESCE($3, stellar_transaction_hash), \
                 status_message = $4, \
                 locked_until = $5, \
                 completed_at = {}, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'PROCESSING' \
             RETURNING {}",
            completed, COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(id)
            .bind(to.as_str())
            .bind(hash)
            .bind(message)
            .bind(locked_until)
            .fetch_optional(&*self.db_pool)
            .await?;

        match row {
            Some(row) => from_row(&row),
            None => {
                let current = self.get(id).await?;
                Err(SubmissionError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status.to_string(),
                    to: to.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl SubmitterTransactionStore for PgSubmitterTransactionStore {
    async fn bulk_get_or_insert(
        &self,
        transactions: &[NewSubmitterTransaction],
    ) -> Result<Vec<SubmitterTransaction>> {
        let mut db_tx = self.db_pool.begin().await?;
        let mut stored = Vec::with_capacity(transactions.len());

        let insert = format!(
            "INSERT INTO submitter_transactions \
                 (id, external_id, tenant_id, status, asset_code, asset_issuer, amount, destination, memo, memo_type) \
             VALUES ($1, $2, $3, 'PENDING', $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (external_id) WHERE status IN {} DO NOTHING \
             RETURNING {}",
            LIVE_STATUSES, COLUMNS
        );
        let existing = format!(
            "SELECT {} FROM submitter_transactions \
             WHERE external_id = $1 AND status IN {} \
             ORDER BY created_at DESC LIMIT 1",
            COLUMNS, LIVE_STATUSES
        );

        for new in transactions {
            let inserted = sqlx::query(&insert)
                .bind(Uuid::new_v4().to_string())
                .bind(&new.external_id)
                .bind(&new.tenant_id)
                .bind(&new.asset_code)
                .bind(&new.asset_issuer)
                .bind(new.amount.round_dp(7))
                .bind(&new.destination)
                .bind(&new.memo)
                .bind(&new.memo_type)
                .fetch_optional(&mut *db_tx)
                .await?;

            let row = match inserted {
                Some(row) => row,
                None => {
                    sqlx::query(&existing)
                        .bind(&new.external_id)
                        .fetch_one(&mut *db_tx)
                        .await?
                }
            };
            stored.push(from_row(&row)?);
        }

        db_tx.commit().await?;
        debug!(count = stored.len(), "Queued submitter transactions");
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<SubmitterTransaction> {
        let query = format!("SELECT {} FROM submitter_transactions WHERE id = $1", COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&*self.db_pool)
            .await?
            .ok_or_else(|| SubmissionError::TransactionNotFound(id.to_string()))?;
        from_row(&row)
    }

    async fn list_by_external_id(&self, external_id: &str) -> Result<Vec<SubmitterTransaction>> {
        let query = format!(
            "SELECT {} FROM submitter_transactions WHERE external_id = $1 ORDER BY created_at",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(external_id)
            .fetch_all(&*self.db_pool)
            .await?;
        rows.iter().map(from_row).collect()
    }

    async fn claim_pending(&self, limit: usize) -> Result<Vec<SubmitterTransaction>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query = format!(
            "UPDATE submitter_transactions \
             SET status = 'PROCESSING', attempts = attempts + 1, \
                 processing_started_at = NOW(), updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM submitter_transactions \
                 WHERE status = 'PENDING' \
                   AND (locked_until IS NULL OR locked_until <= NOW()) \
                 ORDER BY created_at \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {}",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(&*self.db_pool)
            .await?;

        let mut claimed = rows.iter().map(from_row).collect::<Result<Vec<_>>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(claimed)
    }

    async fn record_attempt(
        &self,
        id: &str,
        hash: &str,
        channel_account: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE submitter_transactions \
             SET stellar_transaction_hash = $2, channel_account = $3, locked_until = $4, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'PROCESSING'",
        )
        .bind(id)
        .bind(hash)
        .bind(channel_account)
        .bind(locked_until)
        .execute(&*self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SubmissionError::TransactionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_success(&self, id: &str, hash: &str) -> Result<SubmitterTransaction> {
        self.finish(id, TransactionStatus::Success, Some(hash), None, None).await
    }

    async fn mark_error(&self, id: &str, message: &str) -> Result<SubmitterTransaction> {
        self.finish(id, TransactionStatus::Error, None, Some(message), None).await
    }

    async fn release_for_retry(
        &self,
        id: &str,
        message: &str,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<SubmitterTransaction> {
        self.finish(id, TransactionStatus::Pending, None, Some(message), locked_until)
            .await
    }

    async fn reset_stuck_processing(&self, older_than: Duration) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE submitter_transactions \
             SET status = 'PENDING', updated_at = NOW() \
             WHERE status = 'PROCESSING' \
               AND processing_started_at < NOW() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&*self.db_pool)
        .await?;

        let reset = result.rows_affected() as usize;
        if reset > 0 {
            info!(reset, "Returned stuck submitter transactions to pending");
        }
        Ok(reset)
    }
}

/// Submitter transactions held in memory
#[derive(Default)]
pub struct InMemorySubmitterTransactionStore {
    rows: RwLock<Vec<SubmitterTransaction>>,
}

impl InMemorySubmitterTransactionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, in insertion order
    pub fn all(&self) -> Vec<SubmitterTransaction> {
        self.rows.read().clone()
    }

    fn transition(
        &self,
        id: &str,
        to: TransactionStatus,
        hash: Option<&str>,
        message: Option<&str>,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<SubmitterTransaction> {
        let mut rows = self.rows.write();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| SubmissionError::TransactionNotFound(id.to_string()))?;

        if !row.status.can_transition_to(to) {
            return Err(SubmissionError::InvalidTransition {
                id: id.to_string(),
                from: row.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        row.status = to;
        if let Some(hash) = hash {
            row.stellar_transaction_hash = Some(hash.to_string());
        }
        row.status_message = message.map(str::to_string);
        row.locked_until = locked_until;
        row.updated_at = now;
        row.completed_at = to.is_final().then_some(now);
        Ok(row.clone())
    }
}

#[async_trait]
impl SubmitterTransactionStore for InMemorySubmitterTransactionStore {
    async fn bulk_get_or_insert(
        &self,
        transactions: &[NewSubmitterTransaction],
    ) -> Result<Vec<SubmitterTransaction>> {
        let mut rows = self.rows.write();
        let mut stored = Vec::with_capacity(transactions.len());

        for new in transactions {
            let live = rows
                .iter()
                .rev()
                .find(|r| r.external_id == new.external_id && r.status != TransactionStatus::Error)
                .cloned();

            match live {
                Some(row) => stored.push(row),
                None => {
                    let row = new.clone().into_pending();
                    rows.push(row.clone());
                    stored.push(row);
                }
            }
        }
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<SubmitterTransaction> {
        self.rows
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| SubmissionError::TransactionNotFound(id.to_string()))
    }

    async fn list_by_external_id(&self, external_id: &str) -> Result<Vec<SubmitterTransaction>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|r| r.external_id == external_id)
            .cloned()
            .collect())
    }

    async fn claim_pending(&self, limit: usize) -> Result<Vec<SubmitterTransaction>> {
        let mut rows = self.rows.write();
        let now = Utc::now();
        let mut claimed = Vec::new();

        for row in rows
            .iter_mut()
            .filter(|r| {
                r.status == TransactionStatus::Pending
                    && r.locked_until.map_or(true, |until| until <= now)
            })
            .take(limit)
        {
            row.status = TransactionStatus::Processing;
            row.attempts += 1;
            row.processing_started_at = Some(now);
            row.updated_at = now;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn record_attempt(
        &self,
        id: &str,
        hash: &str,
        channel_account: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id && r.status == TransactionStatus::Processing)
            .ok_or_else(|| SubmissionError::TransactionNotFound(id.to_string()))?;

        row.stellar_transaction_hash = Some(hash.to_string());
        row.channel_account = Some(channel_account.to_string());
        row.locked_until = Some(locked_until);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_success(&self, id: &str, hash: &str) -> Result<SubmitterTransaction> {
        self.transition(id, TransactionStatus::Success, Some(hash), None, None)
    }

    async fn mark_error(&self, id: &str, message: &str) -> Result<SubmitterTransaction> {
        self.transition(id, TransactionStatus::Error, None, Some(message), None)
    }

    async fn release_for_retry(
        &self,
        id: &str,
        message: &str,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<SubmitterTransaction> {
        self.transition(id, TransactionStatus::Pending, None, Some(message), locked_until)
    }

    async fn reset_stuck_processing(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut reset = 0;
        for row in self.rows.write().iter_mut().filter(|r| {
            r.status == TransactionStatus::Processing
                && r.processing_started_at.map_or(true, |at| at <= cutoff)
        }) {
            row.status = TransactionStatus::Pending;
            row.updated_at = Utc::now();
            reset += 1;
        }
        Ok(reset)
    }
}
