//! In-process transport

use crate::publisher::{validate_all, Producer};
use crate::subscriber::{handle_message, Consumer, EventHandler};
use crate::{Error, Message, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Topic queues held in memory
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    written: Mutex<Vec<Message>>,
    notify: Notify,
    reject_writes: AtomicBool,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until turned off again
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Every message ever written, in order
    pub fn written(&self) -> Vec<Message> {
        self.written.lock().clone()
    }

    /// Messages written to `topic`
    pub fn written_to(&self, topic: &str) -> Vec<Message> {
        self.written
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Messages waiting on `topic`
    pub fn pending(&self, topic: &str) -> usize {
        self.queues.lock().get(topic).map(VecDeque::len).unwrap_or(0)
    }

    fn pop(&self, topic: &str) -> Option<Message> {
        self.queues.lock().get_mut(topic).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl Producer for InMemoryBroker {
    async fn write_messages(&self, messages: &[Message]) -> Result<()> {
        validate_all(messages)?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::Publish("broker is rejecting writes".to_string()));
        }

        {
            let mut queues = self.queues.lock();
            let mut written = self.written.lock();
            for message in messages {
                queues
                    .entry(message.topic.clone())
                    .or_default()
                    .push_back(message.clone());
                written.push(message.clone());
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Consumer of one in-memory topic
pub struct InMemoryConsumer {
    broker: Arc<InMemoryBroker>,
    topic: String,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl InMemoryConsumer {
    /// Create a consumer for `topic`
    pub fn new(
        broker: Arc<InMemoryBroker>,
        topic: impl Into<String>,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            handlers,
        }
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read_message(&self) -> Result<()> {
        loop {
            // Register interest before checking so a concurrent write is not missed.
            let notified = self.broker.notify.notified();
            if let Some(message) = self.broker.pop(&self.topic) {
                handle_message(&self.handlers, &message).await;
                return Ok(());
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn can_handle(&self, _message: &Message) -> bool {
            true
        }

        async fn handle(&self, _message: &Message) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(topic: &str, key: &str) -> Message {
        Message::new(topic, key, "tenant", "type", &json!({"k": key})).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_batch_writes_nothing() {
        let broker = InMemoryBroker::new();
        let mut bad = message("events.a", "2");
        bad.tenant_id = String::new();

        assert!(broker
            .write_messages(&[message("events.a", "1"), bad])
            .await
            .is_err());
        assert!(broker.written().is_empty());
        assert_eq!(broker.pending("events.a"), 0);
    }

    #[tokio::test]
    async fn test_consumer_waits_for_a_message() {
        let broker = Arc::new(InMemoryBroker::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let consumer = InMemoryConsumer::new(broker.clone(), "events.a", vec![counter.clone()]);

        let reader = tokio::spawn(async move { consumer.read_message().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        broker
            .write_messages(&[message("events.b", "ignored"), message("events.a", "1")])
            .await
            .unwrap();
        reader.await.unwrap().unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(broker.pending("events.b"), 1);
    }
}
