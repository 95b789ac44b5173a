//! Message envelope for pub/sub

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message is written to
    pub topic: String,

    /// Ordering and deduplication key
    pub key: String,

    /// Tenant the message belongs to
    pub tenant_id: String,

    /// Event type within the topic
    #[serde(rename = "type")]
    pub message_type: String,

    /// Payload
    pub data: serde_json::Value,
}

impl Message {
    /// Create a message, serializing `data`
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        key: impl Into<String>,
        tenant_id: impl Into<String>,
        message_type: impl Into<String>,
        data: &T,
    ) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            key: key.into(),
            tenant_id: tenant_id.into(),
            message_type: message_type.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Check the envelope is complete
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::InvalidMessage("message topic is empty".to_string()));
        }
        if self.key.trim().is_empty() {
            return Err(Error::InvalidMessage("message key is empty".to_string()));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(Error::InvalidMessage("message tenant ID is empty".to_string()));
        }
        if self.message_type.trim().is_empty() {
            return Err(Error::InvalidMessage("message type is empty".to_string()));
        }
        if self.data.is_null() {
            return Err(Error::InvalidMessage("message data is empty".to_string()));
        }
        Ok(())
    }

    /// Decode the payload
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message{{topic: {}, key: {}, tenant_id: {}, type: {}}}",
            self.topic, self.key, self.tenant_id, self.message_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use serde_json::json;

    fn message() -> Message {
        Message::new(
            "events.payment.ready_to_pay",
            "payment-1",
            "tenant-1",
            "payment-ready-to-pay",
            &json!({"payments": [{"id": "payment-1"}]}),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_message() {
        assert_ok!(message().validate());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut msg = message();
        msg.topic = String::new();
        assert!(matches!(msg.validate(), Err(Error::InvalidMessage(m)) if m.contains("topic")));

        let mut msg = message();
        msg.key = " ".to_string();
        assert_err!(msg.validate());

        let mut msg = message();
        msg.tenant_id = String::new();
        assert_err!(msg.validate());

        let mut msg = message();
        msg.message_type = String::new();
        assert_err!(msg.validate());

        let mut msg = message();
        msg.data = serde_json::Value::Null;
        assert!(matches!(msg.validate(), Err(Error::InvalidMessage(m)) if m.contains("data")));
    }

    #[test]
    fn test_type_field_name_on_the_wire() {
        let bytes = message().to_bytes().unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["type"], "payment-ready-to-pay");
        assert_eq!(Message::from_bytes(&bytes).unwrap(), message());
    }
}
