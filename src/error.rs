//! Error types for commerce-events

use thiserror::Error;

/// Error returned by an event handler.
///
/// Handlers are business code; any error type converts into this with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the messaging layer
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure (including a missing broker acknowledgment)
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Poll failure while waiting for the next message
    #[error("Failed to poll topic '{topic}': {reason}")]
    Poll { topic: String, reason: String },

    /// Offset commit failure
    #[error("Failed to commit offset {offset} on {topic}[{partition}]: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// Event serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload could not be decoded into the bound event type
    #[error("Failed to deserialize {event_type}: {reason}")]
    Deserialization {
        event_type: String,
        reason: String,
        raw: String,
    },

    /// Event handler failure
    #[error("Handler for {event_type} failed: {reason}")]
    Handler { event_type: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The broker client was already closed
    #[error("Broker client closed: {0}")]
    Closed(String),

    /// Dead-letter routing failure
    #[error("Failed to dead-letter message from '{topic}': {reason}")]
    DeadLetter { topic: String, reason: String },

    /// Idempotency store failure
    #[error("Idempotency store error: {0}")]
    Idempotency(String),
}

impl MessagingError {
    /// Returns true for transport-level errors that may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_)
                | MessagingError::Publish { .. }
                | MessagingError::Poll { .. }
                | MessagingError::Commit { .. }
                | MessagingError::Timeout(_)
        )
    }

    /// Returns true for configuration errors detected at construction time
    pub fn is_config_error(&self) -> bool {
        matches!(self, MessagingError::Config(_))
    }
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;
