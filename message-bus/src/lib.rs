//! Event bus for the disbursement engine
//!
//! Provides topic-based messaging with:
//! - A message envelope validated before anything is written
//! - Handler chains per consumer, acknowledged after every handler ran
//! - NATS JetStream transport for durable, at-least-once delivery
//! - An in-memory transport for tests and single-process setups
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod event_consumer;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod subscriber;
pub mod types;

pub use client::{NatsClient, NatsConfig};
pub use error::{Error, Result};
pub use event_consumer::EventConsumer;
pub use memory::{InMemoryBroker, InMemoryConsumer};
pub use message::Message;
pub use publisher::{NatsProducer, Producer, PublisherConfig};
pub use subscriber::{handle_message, Consumer, EventHandler, NatsConsumer, SubscriberConfig};
pub use types::{
    EventPaymentCompletedData, EventPaymentsReadyToPayData, PaymentReadyToPay, ALL_TOPICS,
    CIRCLE_PAYMENT_READY_TO_PAY_TOPIC, PAYMENT_COMPLETED_ERROR_TYPE,
    PAYMENT_COMPLETED_SUCCESS_TYPE, PAYMENT_COMPLETED_TOPIC, PAYMENT_READY_TO_PAY_TOPIC,
    PAYMENT_READY_TO_PAY_TYPE,
};
