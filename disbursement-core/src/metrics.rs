//! Prometheus metrics for tenant data sources

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

lazy_static! {
    /// Tenant pools opened
    pub static ref DATA_SOURCE_POOLS_OPENED: IntCounterVec = register_int_counter_vec!(
        "disbursement_data_source_pools_opened_total",
        "Tenant database pools opened",
        &["tenant"]
    )
    .unwrap();

    /// Tenant pools currently cached
    pub static ref DATA_SOURCE_POOLS_OPEN: IntGauge = register_int_gauge!(
        "disbursement_data_source_pools_open",
        "Tenant database pools currently cached"
    )
    .unwrap();
}
