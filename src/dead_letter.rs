//! Dead-letter routing for messages the consumer loop cannot process
//!
//! Without a dead-letter policy a poison message is never committed: a
//! payload that cannot be decoded and a message whose handler keeps failing
//! are both presented again forever, holding their partition. With a
//! policy, such messages are handed to a `DeadLetterSink` and then committed
//! so the partition moves on.

use crate::broker::BrokerProducer;
use crate::error::{MessagingError, Result};
use crate::types::{
    Delivery, OutboundMessage, HEADER_DEAD_LETTER_REASON, HEADER_ORIGINAL_TOPIC,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A message that was given up on, with the reason
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The original delivery, payload untouched
    pub delivery: Delivery,

    /// Event type the consumer was bound to
    pub event_type: String,

    /// Why the message was dead-lettered
    pub reason: String,

    /// Handler attempts made before giving up (0 for undecodable payloads)
    pub attempts: u32,

    /// When the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Create a new dead letter stamped with the current time
    pub fn new(
        delivery: Delivery,
        event_type: impl Into<String>,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            delivery,
            event_type: event_type.into(),
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Destination for dead letters
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Accept a dead letter. `Err` keeps the message uncommitted.
    async fn send(&self, letter: DeadLetter) -> Result<()>;
}

/// When to dead-letter and where to
#[derive(Clone)]
pub struct DeadLetterPolicy {
    /// Where dead letters go
    pub sink: Arc<dyn DeadLetterSink>,

    /// Handler attempts before giving up; `None` dead-letters only
    /// undecodable payloads and retries handler failures forever
    pub max_attempts: Option<u32>,
}

impl DeadLetterPolicy {
    pub fn new(sink: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            sink,
            max_attempts: None,
        }
    }

    /// Give up on a message after `attempts` failed handler runs
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Check whether a message that failed `attempts` times should be
    /// dead-lettered
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Dead-letter topic for a source topic
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// In-memory dead-letter queue for development and testing
///
/// Keeps at most `max_letters`, dropping the oldest first.
pub struct MemoryDeadLetterQueue {
    letters: RwLock<Vec<DeadLetter>>,
    max_letters: usize,
}

impl MemoryDeadLetterQueue {
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: RwLock::new(Vec::new()),
            max_letters,
        }
    }

    /// Number of letters held
    pub async fn count(&self) -> usize {
        self.letters.read().await.len()
    }

    /// Most recent letters first
    pub async fn list(&self, limit: usize) -> Vec<DeadLetter> {
        let letters = self.letters.read().await;
        letters.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for MemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterQueue {
    async fn send(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            topic = %letter.delivery.topic,
            partition = letter.delivery.partition,
            offset = letter.delivery.offset,
            event_type = %letter.event_type,
            attempts = letter.attempts,
            reason = %letter.reason,
            "Message dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let drain_count = letters.len() - self.max_letters;
            letters.drain(..drain_count);
        }

        Ok(())
    }
}

/// Republishes dead letters to `<topic>.dlq` with the original key and
/// payload, plus reason and origin headers
pub struct TopicDeadLetterSink {
    producer: Arc<dyn BrokerProducer>,
}

impl TopicDeadLetterSink {
    pub fn new(producer: Arc<dyn BrokerProducer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl DeadLetterSink for TopicDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<()> {
        let source = letter.delivery.topic.clone();
        let topic = dead_letter_topic(&source);
        let key = letter.delivery.key.clone().unwrap_or_default();

        let mut message = OutboundMessage::new(&topic, key, letter.delivery.payload.clone());
        message.headers = letter.delivery.headers.clone();
        let message = message
            .with_header(HEADER_DEAD_LETTER_REASON, letter.reason.as_str())
            .with_header(HEADER_ORIGINAL_TOPIC, source.as_str());

        let ack = self
            .producer
            .send(message)
            .await
            .map_err(|e| MessagingError::DeadLetter {
                topic: source.clone(),
                reason: e.to_string(),
            })?;

        tracing::warn!(
            topic = %source,
            dead_letter_topic = %topic,
            offset = letter.delivery.offset,
            dlq_offset = ack.offset,
            event_type = %letter.event_type,
            reason = %letter.reason,
            "Message dead-lettered to topic"
        );
        Ok(())
    }
}
