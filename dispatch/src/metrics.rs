//! Prometheus metrics for payment dispatch

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    /// Payments leaving dispatch, by platform and outcome
    pub static ref PAYMENTS_DISPATCHED: IntCounterVec = register_int_counter_vec!(
        "dispatch_payments_total",
        "Payments dispatched by platform and outcome",
        &["platform", "outcome"]
    )
    .unwrap();

    /// Custodial API responses
    pub static ref CUSTODIAL_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "dispatch_custodial_requests_total",
        "Custodial API responses by endpoint and HTTP status",
        &["endpoint", "status"]
    )
    .unwrap();

    /// Custodial API latency
    pub static ref CUSTODIAL_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "dispatch_custodial_request_duration_seconds",
        "Custodial API request latency",
        &["endpoint"]
    )
    .unwrap();

    /// Transfer requests whose status changed during reconciliation
    pub static ref TRANSFERS_RECONCILED: IntCounterVec = register_int_counter_vec!(
        "dispatch_transfers_reconciled_total",
        "Custodial transfer requests reconciled by new status",
        &["status"]
    )
    .unwrap();

    /// Background job runs
    pub static ref JOB_RUNS: IntCounterVec = register_int_counter_vec!(
        "dispatch_job_runs_total",
        "Background job runs by job and outcome",
        &["job", "outcome"]
    )
    .unwrap();
}
