//! Message producers

use crate::{
    client::NatsClient,
    message::Message,
    metrics::{MESSAGE_PUBLISH_DURATION, MESSAGE_PUBLISH_TOTAL},
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Writes messages to their topics
#[async_trait]
pub trait Producer: Send + Sync {
    /// Validate every message, then write them in order. Nothing is written if any
    /// message is invalid.
    async fn write_messages(&self, messages: &[Message]) -> Result<()>;
}

/// Validate a batch before any of it is written
pub fn validate_all(messages: &[Message]) -> Result<()> {
    for message in messages {
        message
            .validate()
            .map_err(|e| Error::InvalidMessage(format!("{}: {}", message, e)))?;
    }
    Ok(())
}

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Max retry attempts
    pub max_retry_attempts: u32,

    /// Initial retry delay
    pub initial_retry_delay: Duration,

    /// Max retry delay
    pub max_retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// JetStream producer
pub struct NatsProducer {
    client: Arc<NatsClient>,
    config: PublisherConfig,
}

impl NatsProducer {
    /// Create a producer over a shared client
    pub fn new(client: Arc<NatsClient>, config: PublisherConfig) -> Self {
        Self { client, config }
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        let start = Instant::now();
        let payload = message.to_bytes()?;

        let result = self.publish_with_retry(&message.topic, &payload).await;

        MESSAGE_PUBLISH_DURATION
            .with_label_values(&[&message.topic])
            .observe(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "success" } else { "error" };
        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[&message.topic, status])
            .inc();

        result
    }

    /// Publish with exponential backoff retry
    async fn publish_with_retry(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let mut attempts = 0;
        let mut delay = self.config.initial_retry_delay;

        loop {
            attempts += 1;

            match self.publish_once(subject, payload).await {
                Ok(_) => {
                    if attempts > 1 {
                        info!(subject, attempts, "Message published after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempts >= self.config.max_retry_attempts {
                        error!(subject, attempts, error = %e, "Failed to publish message");
                        return Err(e);
                    }

                    warn!(subject, attempts, delay_ms = delay.as_millis() as u64, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_retry_delay);
                }
            }
        }
    }

    async fn publish_once(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let js = self.client.jetstream().await?;
        self.client.get_or_create_stream().await?;

        let ack = js
            .publish(subject.to_string(), bytes::Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;
        ack.await
            .map_err(|e| Error::Publish(format!("publish ack failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Producer for NatsProducer {
    async fn write_messages(&self, messages: &[Message]) -> Result<()> {
        validate_all(messages)?;

        for message in messages {
            self.publish(message).await?;
            debug!(topic = %message.topic, key = %message.key, "Message written");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.initial_retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_validate_all_names_the_bad_message() {
        let good = Message::new("events.a", "k1", "t1", "type", &json!({"a": 1})).unwrap();
        let mut bad = good.clone();
        bad.key = String::new();

        assert!(validate_all(&[good.clone()]).is_ok());
        let err = validate_all(&[good, bad]).unwrap_err();
        assert!(err.to_string().contains("message key is empty"));
    }
}
