//! Core message types shared by producers, consumers and broker adapters
//!
//! Configuration-facing types use camelCase JSON; event payloads define
//! their own field casing (see `events`).

use crate::error::MessagingError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Header carrying the logical event type of a message
pub const HEADER_EVENT_TYPE: &str = "event-type";
/// Header carrying a unique id per produced message
pub const HEADER_MESSAGE_ID: &str = "message-id";
/// Header carrying the RFC 3339 production time
pub const HEADER_PRODUCED_AT: &str = "produced-at";
/// Header set on dead-lettered copies of a message
pub const HEADER_DEAD_LETTER_REASON: &str = "dead-letter-reason";
/// Header naming the topic a dead-lettered message came from
pub const HEADER_ORIGINAL_TOPIC: &str = "original-topic";

/// A domain fact that can be published and consumed
///
/// The JSON encoding of the implementing type is the only contract between
/// producer and consumer. Field evolution must be additive.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical event type name, used for topic resolution and logging
    const EVENT_TYPE: &'static str;

    /// Key routing related events (e.g. all events of one order) to the
    /// same partition
    fn partition_key(&self) -> String;

    /// Key identifying this fact for duplicate suppression
    ///
    /// Defaults to `None`, which disables idempotency checks for the type.
    fn idempotency_key(&self) -> Option<String> {
        None
    }
}

/// Message headers (string keys and values)
pub type Headers = HashMap<String, String>;

/// A message ready to be handed to a broker producer
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,

    /// Partition/ordering key
    pub key: String,

    /// Encoded payload
    pub payload: Bytes,

    /// Metadata headers
    pub headers: Headers,
}

impl OutboundMessage {
    /// Create a message without headers
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Broker acknowledgment of a produced message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Topic the message was stored in
    pub topic: String,

    /// Partition the message was stored in
    pub partition: i32,

    /// Offset assigned by the broker
    pub offset: i64,
}

/// A message received from the broker, not yet committed
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Source topic
    pub topic: String,

    /// Source partition
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Partition key, if the producer set one
    pub key: Option<String>,

    /// Raw payload
    pub payload: Bytes,

    /// Metadata headers
    pub headers: Headers,
}

impl Delivery {
    /// Payload rendered as (lossy) UTF-8, for logging and dead letters
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Where a consumer group starts when it has no committed offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from the oldest retained message
    #[default]
    Earliest,
    /// Start from messages produced after subscription
    Latest,
}

impl OffsetReset {
    /// Broker-native string value
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetReset {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(MessagingError::Config(format!(
                "Unknown auto offset reset policy: {other}"
            ))),
        }
    }
}
