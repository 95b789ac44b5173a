//! Error types for the event bus

use thiserror::Error;

/// Event bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Message failed validation and was not written
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscribe error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Stream or consumer setup error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler failed
    #[error("handler {handler} failed: {reason}")]
    Handler {
        /// Handler name
        handler: String,
        /// Failure reason
        reason: String,
    },

    /// Transport closed
    #[error("consumer for topic {0} is closed")]
    Closed(String),
}

impl Error {
    /// Wrap a handler failure
    pub fn handler(handler: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Handler {
            handler: handler.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
