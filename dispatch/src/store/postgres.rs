//! Postgres stores in the tenant database
//!
//! Stores run each statement on the tenant pool, or on one open transaction shared by
//! every store handed out by `PgPaymentModelsProvider::begin`.

use super::{
    CircleRecipient, CircleRecipientStatus, CircleRecipientStore, CircleRecipientUpdate,
    CircleTransferRequest, CircleTransferRequestStore, CircleTransferRequestUpdate,
    CircleTransferStatus, ModelsTransaction, Organization, OrganizationStore, PaymentModels,
    PaymentModelsProvider, PaymentStore, TransactionalModels,
};
use crate::{DispatchError, Result};
use async_trait::async_trait;
use disbursement_core::payment::PaymentStatusHistoryEntry;
use disbursement_core::{
    Asset, Disbursement, DisbursementStatus, Payment, PaymentBatch, PaymentStatus,
    PgDataSourceRouter, ReceiverWallet, ReceiverWalletStatus, Tenant,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "p.id, p.amount, p.asset_code, p.asset_issuer, p.status, \
     p.status_history, p.receiver_wallet_id, p.disbursement_id, p.stellar_transaction_id, \
     p.circle_transfer_id, p.created_at, p.updated_at";

const BATCH_COLUMNS: &str = "rw.receiver_id, rw.status AS receiver_wallet_status, \
     rw.stellar_address, rw.stellar_memo, rw.stellar_memo_type, \
     d.name AS disbursement_name, d.status AS disbursement_status";

const BATCH_JOIN: &str = "FROM payments p \
     JOIN receiver_wallets rw ON rw.id = p.receiver_wallet_id \
     JOIN disbursements d ON d.id = p.disbursement_id";

fn payment_from_row(row: &PgRow) -> Result<Payment> {
    let status: String = row.try_get("status")?;
    let amount: Decimal = row.try_get("amount")?;
    let history: Json<Vec<PaymentStatusHistoryEntry>> = row.try_get("status_history")?;
    let issuer: Option<String> = row.try_get("asset_issuer")?;
    let code: String = row.try_get("asset_code")?;

    Ok(Payment {
        id: row.try_get("id")?,
        amount: amount.normalize().to_string(),
        asset: Asset::new(code, issuer.unwrap_or_default()),
        status: PaymentStatus::from_str(&status)?,
        status_history: history.0,
        receiver_wallet_id: row.try_get("receiver_wallet_id")?,
        disbursement_id: row.try_get("disbursement_id")?,
        stellar_transaction_id: row.try_get("stellar_transaction_id")?,
        circle_transfer_id: row.try_get("circle_transfer_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn batch_from_rows(rows: &[PgRow]) -> Result<PaymentBatch> {
    let mut batch = PaymentBatch::new();
    for row in rows {
        let payment = payment_from_row(row)?;
        let wallet_status: String = row.try_get("receiver_wallet_status")?;
        let disbursement_status: String = row.try_get("disbursement_status")?;

        let wallet = ReceiverWallet {
            id: payment.receiver_wallet_id.clone(),
            receiver_id: row.try_get("receiver_id")?,
            status: ReceiverWalletStatus::from_str(&wallet_status)?,
            stellar_address: row
                .try_get::<Option<String>, _>("stellar_address")?
                .unwrap_or_default(),
            stellar_memo: row.try_get("stellar_memo")?,
            stellar_memo_type: row.try_get("stellar_memo_type")?,
        };
        let disbursement = Disbursement {
            id: payment.disbursement_id.clone(),
            name: row.try_get("disbursement_name")?,
            status: DisbursementStatus::from_str(&disbursement_status)?,
        };
        batch.push(payment, wallet, disbursement);
    }
    Ok(batch)
}

fn history_entry(status: PaymentStatus, message: &str) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(vec![PaymentStatusHistoryEntry {
        status,
        status_message: message.to_string(),
        timestamp: chrono::Utc::now(),
    }])?)
}

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// Where a store runs its statements
#[derive(Clone)]
enum PgConn {
    Pool(Arc<PgPool>),
    Transaction(SharedTransaction),
}

impl PgConn {
    async fn fetch_all(&self, query: Query<'_, Postgres, PgArguments>) -> Result<Vec<PgRow>> {
        match self {
            PgConn::Pool(pool) => Ok(query.fetch_all(&**pool).await?),
            PgConn::Transaction(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(DispatchError::TransactionFinished)?;
                Ok(query.fetch_all(&mut **tx).await?)
            }
        }
    }

    async fn fetch_optional(&self, query: Query<'_, Postgres, PgArguments>) -> Result<Option<PgRow>> {
        match self {
            PgConn::Pool(pool) => Ok(query.fetch_optional(&**pool).await?),
            PgConn::Transaction(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(DispatchError::TransactionFinished)?;
                Ok(query.fetch_optional(&mut **tx).await?)
            }
        }
    }

    async fn execute(&self, query: Query<'_, Postgres, PgArguments>) -> Result<PgQueryResult> {
        match self {
            PgConn::Pool(pool) => Ok(query.execute(&**pool).await?),
            PgConn::Transaction(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(DispatchError::TransactionFinished)?;
                Ok(query.execute(&mut **tx).await?)
            }
        }
    }
}

/// Payments table
pub struct PgPaymentStore {
    conn: PgConn,
}

impl PgPaymentStore {
    /// Create a store
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self {
            conn: PgConn::Pool(db_pool),
        }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn get(&self, id: &str) -> Result<Payment> {
        let query = format!("SELECT {} FROM payments p WHERE p.id = $1", PAYMENT_COLUMNS);
        let row = self
            .conn
            .fetch_optional(sqlx::query(&query).bind(id))
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("payment {}", id)))?;
        payment_from_row(&row)
    }

    async fn get_ready_by_ids(&self, ids: &[String]) -> Result<PaymentBatch> {
        let query = format!(
            "SELECT {}, {} {} WHERE p.id = ANY($1) AND p.status = 'READY' \
             ORDER BY p.created_at, p.id \
             FOR UPDATE OF p SKIP LOCKED",
            PAYMENT_COLUMNS, BATCH_COLUMNS, BATCH_JOIN
        );
        let rows = self.conn.fetch_all(sqlx::query(&query).bind(ids)).await?;
        batch_from_rows(&rows)
    }

    async fn get_batch_for_update(&self, batch_size: usize) -> Result<PaymentBatch> {
        let query = format!(
            "SELECT {}, {} {} \
             WHERE p.status = 'READY' AND rw.status = 'REGISTERED' AND d.status = 'STARTED' \
             ORDER BY p.created_at, p.id \
             LIMIT $1 \
             FOR UPDATE OF p SKIP LOCKED",
            PAYMENT_COLUMNS, BATCH_COLUMNS, BATCH_JOIN
        );

        if matches!(self.conn, PgConn::Pool(_)) {
            warn!("Payments selected for update outside of a transaction are not kept locked");
        }
        let rows = self
            .conn
            .fetch_all(sqlx::query(&query).bind(batch_size as i64))
            .await?;

        debug!(count = rows.len(), "Loaded ready payments");
        batch_from_rows(&rows)
    }

    async fn update_status(
        &self,
        id: &str,
        status: PaymentStatus,
        message: &str,
        stellar_transaction_id: Option<&str>,
    ) -> Result<Payment> {
        let query = format!(
            "UPDATE payments p \
             SET status = $2, \
                 status_history = p.status_history || $3::jsonb, \
                 stellar_transaction_id = COALESCE(NULLIF($4, ''), p.stellar_transaction_id), \
                 updated_at = NOW() \
             WHERE p.id = $1 \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let row = self
            .conn
            .fetch_optional(
                sqlx::query(&query)
                    .bind(id)
                    .bind(status.as_str())
                    .bind(history_entry(status, message)?)
                    .bind(stellar_transaction_id),
            )
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("payment {}", id)))?;
        payment_from_row(&row)
    }

    async fn update_statuses(&self, ids: &[String], status: PaymentStatus, message: &str) -> Result<usize> {
        let result = self
            .conn
            .execute(
                sqlx::query(
                    "UPDATE payments \
                     SET status = $2, status_history = status_history || $3::jsonb, updated_at = NOW() \
                     WHERE id = ANY($1)",
                )
                .bind(ids)
                .bind(status.as_str())
                .bind(history_entry(status, message)?),
            )
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn set_circle_transfer_id(&self, id: &str, transfer_id: &str) -> Result<()> {
        let result = self
            .conn
            .execute(
                sqlx::query("UPDATE payments SET circle_transfer_id = $2, updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .bind(transfer_id),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::NotFound(format!("payment {}", id)));
        }
        Ok(())
    }
}

const TRANSFER_REQUEST_COLUMNS: &str = "idempotency_key, payment_id, circle_transfer_id, \
     circle_payout_id, status, response_body, source_wallet_id, sync_attempts, \
     last_sync_attempt_at, completed_at, created_at, updated_at";

fn transfer_request_from_row(row: &PgRow) -> Result<CircleTransferRequest> {
    let status: Option<String> = row.try_get("status")?;
    let response_body: Option<Json<serde_json::Value>> = row.try_get("response_body")?;
    let sync_attempts: i32 = row.try_get("sync_attempts")?;

    Ok(CircleTransferRequest {
        idempotency_key: row.try_get("idempotency_key")?,
        payment_id: row.try_get("payment_id")?,
        circle_transfer_id: row.try_get("circle_transfer_id")?,
        circle_payout_id: row.try_get("circle_payout_id")?,
        status: status.as_deref().map(CircleTransferStatus::from_str).transpose()?,
        response_body: response_body.map(|body| body.0),
        source_wallet_id: row.try_get("source_wallet_id")?,
        sync_attempts: sync_attempts.max(0) as u32,
        last_sync_attempt_at: row.try_get("last_sync_attempt_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Custodial transfer requests table
pub struct PgCircleTransferRequestStore {
    conn: PgConn,
}

impl PgCircleTransferRequestStore {
    /// Create a store
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self {
            conn: PgConn::Pool(db_pool),
        }
    }
}

#[async_trait]
impl CircleTransferRequestStore for PgCircleTransferRequestStore {
    async fn get_or_insert(&self, payment_id: &str) -> Result<CircleTransferRequest> {
        if let Some(existing) = self.get_incomplete_by_payment_id(payment_id).await? {
            return Ok(existing);
        }

        let query = format!(
            "INSERT INTO circle_transfer_requests (idempotency_key, payment_id) \
             VALUES ($1, $2) \
             ON CONFLICT (payment_id) WHERE completed_at IS NULL DO NOTHING \
             RETURNING {}",
            TRANSFER_REQUEST_COLUMNS
        );
        let inserted = self
            .conn
            .fetch_optional(
                sqlx::query(&query)
                    .bind(Uuid::new_v4().to_string())
                    .bind(payment_id),
            )
            .await?;

        match inserted {
            Some(row) => transfer_request_from_row(&row),
            // Lost the race with a concurrent insert.
            None => self
                .get_incomplete_by_payment_id(payment_id)
                .await?
                .ok_or_else(|| DispatchError::NotFound(format!("circle transfer request for payment {}", payment_id))),
        }
    }

    async fn get_incomplete_by_payment_id(&self, payment_id: &str) -> Result<Option<CircleTransferRequest>> {
        let query = format!(
            "SELECT {} FROM circle_transfer_requests \
             WHERE payment_id = $1 AND completed_at IS NULL \
             ORDER BY created_at DESC LIMIT 1",
            TRANSFER_REQUEST_COLUMNS
        );
        let row = self
            .conn
            .fetch_optional(sqlx::query(&query).bind(payment_id))
            .await?;
        row.as_ref().map(transfer_request_from_row).transpose()
    }

    async fn update(
        &self,
        idempotency_key: &str,
        update: &CircleTransferRequestUpdate,
    ) -> Result<CircleTransferRequest> {
        let query = format!(
            "UPDATE circle_transfer_requests \
             SET circle_transfer_id = COALESCE($2, circle_transfer_id), \
                 circle_payout_id = COALESCE($3, circle_payout_id), \
                 status = COALESCE($4, status), \
                 response_body = COALESCE($5, response_body), \
                 source_wallet_id = COALESCE($6, source_wallet_id), \
                 sync_attempts = COALESCE($7, sync_attempts), \
                 last_sync_attempt_at = COALESCE($8, last_sync_attempt_at), \
                 completed_at = COALESCE($9, completed_at), \
                 updated_at = NOW() \
             WHERE idempotency_key = $1 \
             RETURNING {}",
            TRANSFER_REQUEST_COLUMNS
        );
        let row = self
            .conn
            .fetch_optional(
                sqlx::query(&query)
                    .bind(idempotency_key)
                    .bind(&update.circle_transfer_id)
                    .bind(&update.circle_payout_id)
                    .bind(update.status.map(|s| s.as_str()))
                    .bind(update.response_body.clone().map(Json))
                    .bind(&update.source_wallet_id)
                    .bind(update.sync_attempts.map(|n| n as i32))
                    .bind(update.last_sync_attempt_at)
                    .bind(update.completed_at),
            )
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("circle transfer request {}", idempotency_key)))?;
        transfer_request_from_row(&row)
    }

    async fn get_pending_reconciliation(&self, max_sync_attempts: u32) -> Result<Vec<CircleTransferRequest>> {
        let query = format!(
            "SELECT {} FROM circle_transfer_requests \
             WHERE status = 'pending' AND sync_attempts < $1 \
               AND (circle_transfer_id IS NOT NULL OR circle_payout_id IS NOT NULL) \
             ORDER BY last_sync_attempt_at ASC NULLS FIRST, created_at",
            TRANSFER_REQUEST_COLUMNS
        );
        let rows = self
            .conn
            .fetch_all(sqlx::query(&query).bind(max_sync_attempts as i32))
            .await?;
        rows.iter().map(transfer_request_from_row).collect()
    }
}

const RECIPIENT_COLUMNS: &str = "receiver_wallet_id, idempotency_key, circle_recipient_id, \
     status, response_body, sync_attempts, last_sync_attempt_at, created_at, updated_at";

fn recipient_from_row(row: &PgRow) -> Result<CircleRecipient> {
    let status: Option<String> = row.try_get("status")?;
    let response_body: Option<Json<serde_json::Value>> = row.try_get("response_body")?;
    let sync_attempts: i32 = row.try_get("sync_attempts")?;

    Ok(CircleRecipient {
        receiver_wallet_id: row.try_get("receiver_wallet_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        circle_recipient_id: row.try_get("circle_recipient_id")?,
        status: status.as_deref().map(CircleRecipientStatus::from_str).transpose()?,
        response_body: response_body.map(|body| body.0),
        sync_attempts: sync_attempts.max(0) as u32,
        last_sync_attempt_at: row.try_get("last_sync_attempt_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Custodial recipients table
pub struct PgCircleRecipientStore {
    conn: PgConn,
}

impl PgCircleRecipientStore {
    /// Create a store
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self {
            conn: PgConn::Pool(db_pool),
        }
    }
}

#[async_trait]
impl CircleRecipientStore for PgCircleRecipientStore {
    async fn get_by_receiver_wallet_id(&self, receiver_wallet_id: &str) -> Result<Option<CircleRecipient>> {
        let query = format!(
            "SELECT {} FROM circle_recipients WHERE receiver_wallet_id = $1",
            RECIPIENT_COLUMNS
        );
        let row = self
            .conn
            .fetch_optional(sqlx::query(&query).bind(receiver_wallet_id))
            .await?;
        row.as_ref().map(recipient_from_row).transpose()
    }

    async fn insert(&self, receiver_wallet_id: &str) -> Result<CircleRecipient> {
        let query = format!(
            "INSERT INTO circle_recipients (receiver_wallet_id, idempotency_key) \
             VALUES ($1, $2) RETURNING {}",
            RECIPIENT_COLUMNS
        );
        let row = self
            .conn
            .fetch_optional(
                sqlx::query(&query)
                    .bind(receiver_wallet_id)
                    .bind(Uuid::new_v4().to_string()),
            )
            .await?
            .ok_or(DispatchError::Database(sqlx::Error::RowNotFound))?;
        recipient_from_row(&row)
    }

    async fn update(
        &self,
        receiver_wallet_id: &str,
        update: &CircleRecipientUpdate,
    ) -> Result<CircleRecipient> {
        let query = format!(
            "UPDATE circle_recipients \
             SET idempotency_key = COALESCE($2, idempotency_key), \
                 circle_recipient_id = COALESCE($3, circle_recipient_id), \
                 status = COALESCE($4, status), \
                 response_body = COALESCE($5, response_body), \
                 sync_attempts = COALESCE($6, sync_attempts), \
                 last_sync_attempt_at = COALESCE($7, last_sync_attempt_at), \
                 updated_at = NOW() \
             WHERE receiver_wallet_id = $1 \
             RETURNING {}",
            RECIPIENT_COLUMNS
        );
        let row = self
            .conn
            .fetch_optional(
                sqlx::query(&query)
                    .bind(receiver_wallet_id)
                    .bind(&update.idempotency_key)
                    .bind(&update.circle_recipient_id)
                    .bind(update.status.map(|s| s.as_str()))
                    .bind(update.response_body.clone().map(Json))
                    .bind(update.sync_attempts.map(|n| n as i32))
                    .bind(update.last_sync_attempt_at),
            )
            .await?
            .ok_or_else(|| {
                DispatchError::NotFound(format!("circle recipient for receiver wallet {}", receiver_wallet_id))
            })?;
        recipient_from_row(&row)
    }
}

/// Organizations table; a tenant database holds exactly one row
pub struct PgOrganizationStore {
    conn: PgConn,
}

impl PgOrganizationStore {
    /// Create a store
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self {
            conn: PgConn::Pool(db_pool),
        }
    }
}

#[async_trait]
impl OrganizationStore for PgOrganizationStore {
    async fn get(&self) -> Result<Organization> {
        let row = self
            .conn
            .fetch_optional(sqlx::query("SELECT name, memo_tracing_enabled FROM organizations LIMIT 1"))
            .await?
            .ok_or_else(|| DispatchError::NotFound("organization".to_string()))?;

        Ok(Organization {
            name: row.try_get("name")?,
            memo_tracing_enabled: row.try_get("memo_tracing_enabled")?,
        })
    }
}

impl PaymentModels {
    /// Postgres stores over one tenant pool
    pub fn postgres(db_pool: Arc<PgPool>) -> Self {
        Self::over(PgConn::Pool(db_pool))
    }

    fn over(conn: PgConn) -> Self {
        Self {
            payments: Arc::new(PgPaymentStore { conn: conn.clone() }),
            transfer_requests: Arc::new(PgCircleTransferRequestStore { conn: conn.clone() }),
            recipients: Arc::new(PgCircleRecipientStore { conn: conn.clone() }),
            organizations: Arc::new(PgOrganizationStore { conn }),
        }
    }
}

/// Transaction shared by the stores of one `TransactionalModels`
struct PgModelsTransaction {
    tx: SharedTransaction,
}

impl PgModelsTransaction {
    async fn take(&self) -> Result<Transaction<'static, Postgres>> {
        self.tx
            .lock()
            .await
            .take()
            .ok_or(DispatchError::TransactionFinished)
    }
}

#[async_trait]
impl ModelsTransaction for PgModelsTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.take().await?.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.take().await?.rollback().await?;
        Ok(())
    }
}

/// Provider opening tenant pools through the data source router
pub struct PgPaymentModelsProvider {
    router: Arc<PgDataSourceRouter>,
}

impl PgPaymentModelsProvider {
    /// Create a provider
    pub fn new(router: Arc<PgDataSourceRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl PaymentModelsProvider for PgPaymentModelsProvider {
    async fn models_for(&self, tenant: &Tenant) -> Result<PaymentModels> {
        let pool = self.router.get_data_source_for_tenant(tenant).await?;
        Ok(PaymentModels::postgres(pool))
    }

    async fn begin(&self, tenant: &Tenant) -> Result<TransactionalModels> {
        let pool = self.router.get_data_source_for_tenant(tenant).await?;
        let tx: SharedTransaction = Arc::new(Mutex::new(Some(pool.begin().await?)));
        Ok(TransactionalModels::new(
            PaymentModels::over(PgConn::Transaction(tx.clone())),
            Box::new(PgModelsTransaction { tx }),
        ))
    }
}
