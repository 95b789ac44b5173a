//! Long-running consume loop

use crate::subscriber::Consumer;
use crate::Error;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Drives a consumer until shutdown, backing off when reads fail
pub struct EventConsumer {
    consumer: Arc<dyn Consumer>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl EventConsumer {
    /// Wrap a consumer with the default backoff (1s doubling up to 1 minute)
    pub fn new(consumer: Arc<dyn Consumer>) -> Self {
        Self {
            consumer,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Override the read-error backoff
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Consume until `shutdown` turns true. A message being handled when shutdown
    /// arrives is left unacknowledged and will be redelivered.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let topic = self.consumer.topic().to_string();
        info!(topic = %topic, "Starting consuming messages");
        let mut backoff = self.backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.consumer.read_message() => result,
            };

            match result {
                Ok(()) => backoff.reset(),
                Err(Error::Closed(_)) => {
                    warn!(topic = %topic, "Consumer closed");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
                    error!(
                        topic = %topic,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Error consuming messages, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(topic = %topic, "Stopped consuming messages");
    }
}
