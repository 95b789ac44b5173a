//! Prometheus metrics for the event bus

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Total messages published
    pub static ref MESSAGE_PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_publish_total",
        "Total messages published",
        &["topic", "status"]
    )
    .unwrap();

    /// Message publish duration
    pub static ref MESSAGE_PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_publish_duration_seconds",
        "Message publish duration in seconds",
        &["topic"]
    )
    .unwrap();

    /// Total messages received
    pub static ref MESSAGE_RECEIVE_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_receive_total",
        "Total messages received",
        &["topic", "status"]
    )
    .unwrap();

    /// Handler runs by outcome
    pub static ref HANDLER_RUNS_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_handler_runs_total",
        "Event handler runs",
        &["handler", "status"]
    )
    .unwrap();

    /// Message processing duration
    pub static ref MESSAGE_PROCESS_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_process_duration_seconds",
        "Message processing duration in seconds",
        &["topic"]
    )
    .unwrap();

    /// NATS connection attempts by outcome
    pub static ref NATS_CONNECTION_STATUS: CounterVec = register_counter_vec!(
        "nats_connection_status",
        "NATS connection attempts (connected/failed)",
        &["status"]
    )
    .unwrap();
}
