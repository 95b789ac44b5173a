//! Prometheus metrics for transaction submission

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    /// Channel accounts created on the ledger
    pub static ref CHANNEL_ACCOUNTS_CREATED: IntCounter = register_int_counter!(
        "submission_channel_accounts_created_total",
        "Channel accounts created on the ledger"
    )
    .unwrap();

    /// Channel accounts merged back into the host account or purged
    pub static ref CHANNEL_ACCOUNTS_DELETED: IntCounter = register_int_counter!(
        "submission_channel_accounts_deleted_total",
        "Channel accounts deleted"
    )
    .unwrap();

    /// Submitter transactions reaching an outcome
    pub static ref TRANSACTIONS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "submission_transactions_processed_total",
        "Submitter transactions processed by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Time from claim to outcome
    pub static ref TRANSACTION_PROCESSING_DURATION: HistogramVec = register_histogram_vec!(
        "submission_transaction_processing_duration_seconds",
        "Time to process a claimed submitter transaction",
        &["outcome"]
    )
    .unwrap();

    /// Rows claimed per pass
    pub static ref PROCESSING_LIMIT: IntGauge = register_int_gauge!(
        "submission_processing_limit",
        "Submitter transactions claimed per worker pass"
    )
    .unwrap();

    /// Timeouts and gateway errors from the ledger
    pub static ref INDETERMINATE_RESPONSES: IntCounter = register_int_counter!(
        "submission_indeterminate_responses_total",
        "Ledger responses whose outcome was unknown"
    )
    .unwrap();
}
