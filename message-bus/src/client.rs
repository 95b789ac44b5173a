//! NATS connection and JetStream stream setup

use crate::metrics::NATS_CONNECTION_STATUS;
use crate::{Error, Result};
use async_nats::jetstream::{
    self,
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};

/// NATS connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,
    /// Stream holding every event topic
    pub stream_name: String,
    /// Subjects bound to the stream
    pub subjects: Vec<String>,
    /// How long messages are kept
    pub max_age: Duration,
    /// Window in which the same message id is dropped as a duplicate
    pub duplicate_window: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "DISBURSEMENT_EVENTS".to_string(),
            subjects: vec!["events.>".to_string()],
            max_age: Duration::from_secs(7 * 24 * 3600),
            duplicate_window: Duration::from_secs(120),
        }
    }
}

/// Lazily connected NATS client
pub struct NatsClient {
    config: NatsConfig,
    client: OnceCell<async_nats::Client>,
}

impl NatsClient {
    /// Create a client; the connection is made on first use
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    /// Connection settings
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Core NATS client
    pub async fn client(&self) -> Result<&async_nats::Client> {
        self.client
            .get_or_try_init(|| async {
                info!(url = %self.config.url, "Connecting to NATS");
                match async_nats::connect(&self.config.url).await {
                    Ok(client) => {
                        NATS_CONNECTION_STATUS.with_label_values(&["connected"]).inc();
                        Ok(client)
                    }
                    Err(e) => {
                        NATS_CONNECTION_STATUS.with_label_values(&["failed"]).inc();
                        error!(url = %self.config.url, error = %e, "NATS connection failed");
                        Err(Error::Connection(e.to_string()))
                    }
                }
            })
            .await
    }

    /// JetStream context over the connection
    pub async fn jetstream(&self) -> Result<jetstream::Context> {
        Ok(jetstream::new(self.client().await?.clone()))
    }

    /// Stream carrying the event topics, created if missing
    pub async fn get_or_create_stream(&self) -> Result<jetstream::stream::Stream> {
        let config = StreamConfig {
            name: self.config.stream_name.clone(),
            description: Some("Disbursement engine events".to_string()),
            subjects: self.config.subjects.clone(),
            retention: RetentionPolicy::Limits,
            max_age: self.config.max_age,
            storage: StorageType::File,
            duplicate_window: self.config.duplicate_window,
            ..Default::default()
        };

        self.jetstream()
            .await?
            .get_or_create_stream(config)
            .await
            .map_err(|e| Error::JetStream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stream_covers_event_topics() {
        let config = NatsConfig::default();
        assert_eq!(config.subjects, vec!["events.>".to_string()]);
        assert_eq!(config.stream_name, "DISBURSEMENT_EVENTS");
    }
}
