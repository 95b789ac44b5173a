//! Consumers and the handler chain

use crate::{
    client::NatsClient,
    message::Message,
    metrics::{HANDLER_RUNS_TOTAL, MESSAGE_PROCESS_DURATION, MESSAGE_RECEIVE_TOTAL},
    Error, Result,
};
use async_nats::jetstream::{self, consumer};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Handles the messages it recognizes
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name, used in logs and metrics
    fn name(&self) -> &str;

    /// Whether this handler wants the message
    fn can_handle(&self, message: &Message) -> bool;

    /// Process the message
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Reads messages from one topic and runs them through its handlers
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Topic consumed
    fn topic(&self) -> &str;

    /// Wait for one message, run every matching handler, then acknowledge it
    async fn read_message(&self) -> Result<()>;
}

/// Run `message` through every handler that accepts it. Handler errors are logged and
/// counted, never propagated. Returns the number of failed handlers.
pub async fn handle_message(handlers: &[Arc<dyn EventHandler>], message: &Message) -> usize {
    let start = Instant::now();
    let mut failed = 0;

    for handler in handlers.iter().filter(|h| h.can_handle(message)) {
        match handler.handle(message).await {
            Ok(()) => {
                HANDLER_RUNS_TOTAL
                    .with_label_values(&[handler.name(), "success"])
                    .inc();
            }
            Err(e) => {
                failed += 1;
                HANDLER_RUNS_TOTAL
                    .with_label_values(&[handler.name(), "error"])
                    .inc();
                error!(
                    handler = handler.name(),
                    topic = %message.topic,
                    key = %message.key,
                    error = %e,
                    "Error handling message"
                );
            }
        }
    }

    MESSAGE_PROCESS_DURATION
        .with_label_values(&[&message.topic])
        .observe(start.elapsed().as_secs_f64());
    failed
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Consumer group; consumers sharing it split the messages between them
    pub consumer_group: String,

    /// Acknowledgment wait time
    pub ack_wait: Duration,

    /// Max delivery attempts
    pub max_deliver: i64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            consumer_group: "disbursement-workers".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
        }
    }
}

impl SubscriberConfig {
    /// Durable consumer name for a topic; dots are not allowed in names
    pub fn durable_name(&self, topic: &str) -> String {
        format!("{}-{}", self.consumer_group, topic.replace('.', "_"))
    }
}

/// JetStream pull consumer bound to one topic
pub struct NatsConsumer {
    topic: String,
    handlers: Vec<Arc<dyn EventHandler>>,
    messages: Mutex<consumer::pull::Stream>,
}

impl NatsConsumer {
    /// Create or reuse the durable consumer for `topic`
    pub async fn connect(
        client: &NatsClient,
        config: &SubscriberConfig,
        topic: impl Into<String>,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Result<Self> {
        let topic = topic.into();
        let stream = client.get_or_create_stream().await?;
        let durable_name = config.durable_name(&topic);

        let consumer_config = consumer::pull::Config {
            durable_name: Some(durable_name.clone()),
            filter_subject: topic.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
            deliver_policy: consumer::DeliverPolicy::All,
            ..Default::default()
        };

        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(&durable_name, consumer_config)
            .await
            .map_err(|e| Error::JetStream(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        info!(topic = %topic, consumer = %durable_name, handlers = handlers.len(), "JetStream consumer ready");
        Ok(Self {
            topic,
            handlers,
            messages: Mutex::new(messages),
        })
    }
}

#[async_trait]
impl Consumer for NatsConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read_message(&self) -> Result<()> {
        let msg = {
            let mut messages = self.messages.lock().await;
            messages
                .next()
                .await
                .ok_or_else(|| Error::Closed(self.topic.clone()))?
                .map_err(|e| Error::Subscribe(e.to_string()))?
        };

        let message = match Message::from_bytes(&msg.payload) {
            Ok(message) => message,
            Err(e) => {
                MESSAGE_RECEIVE_TOTAL
                    .with_label_values(&[&self.topic, "parse_error"])
                    .inc();
                warn!(topic = %self.topic, error = %e, "Dropping unreadable message");
                // Terminate so the bad message is never redelivered.
                msg.ack_with(jetstream::AckKind::Term)
                    .await
                    .map_err(|e| Error::Subscribe(e.to_string()))?;
                return Ok(());
            }
        };

        MESSAGE_RECEIVE_TOTAL
            .with_label_values(&[&self.topic, "success"])
            .inc();
        handle_message(&self.handlers, &message).await;

        msg.ack()
            .await
            .map_err(|e| Error::Subscribe(format!("ack failed for key {}: {}", message.key, e)))
    }
}
