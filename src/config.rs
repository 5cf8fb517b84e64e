//! Messaging configuration
//!
//! Settings load from JSON (`from_json`) or environment variables
//! (`from_env`). Every field has a default so partial documents work.
//! Call `validate()` before connecting; invalid settings fail fast.

use crate::error::{MessagingError, Result};
use crate::types::OffsetReset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Top-level messaging settings shared by producers and consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingSettings {
    /// Broker endpoints (`host:port`, or URLs for NATS)
    pub bootstrap_servers: Vec<String>,

    /// Producer settings
    pub producer: ProducerSettings,

    /// Consumer settings
    pub consumer: ConsumerSettings,

    /// Logical event type → topic map
    pub topics: TopicSettings,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
            topics: TopicSettings::default(),
        }
    }
}

/// Producer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProducerSettings {
    /// Client identifier reported to the broker
    pub client_id: String,

    /// How long a send may wait for the broker acknowledgment
    pub message_timeout_ms: u64,

    /// Upper bound on the flush performed at shutdown
    pub flush_timeout_ms: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            client_id: "commerce-events".to_string(),
            message_timeout_ms: 5_000,
            flush_timeout_ms: 10_000,
        }
    }
}

impl ProducerSettings {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerSettings {
    /// Consumer group id
    pub group_id: String,

    /// Start position when the group has no committed offset
    pub auto_offset_reset: OffsetReset,

    /// Must stay `false`: offsets are committed only after handling
    pub enable_auto_commit: bool,

    /// Upper bound on a single poll, so cancellation is observed promptly
    pub poll_timeout_ms: u64,

    /// Broker session timeout for group membership
    pub session_timeout_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            auto_offset_reset: OffsetReset::Earliest,
            enable_auto_commit: false,
            poll_timeout_ms: 1_000,
            session_timeout_ms: 30_000,
        }
    }
}

impl ConsumerSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Logical event type → topic map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicSettings {
    /// Topic for `OrderCreated`
    pub order_created: String,

    /// Topic for `UserCreated`
    pub user_created: String,

    /// Additional event types (event type name → topic)
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            order_created: "order.created".to_string(),
            user_created: "user.created".to_string(),
            extra: HashMap::new(),
        }
    }
}

impl TopicSettings {
    /// Resolve the topic bound to a logical event type
    pub fn topic_for(&self, event_type: &str) -> Result<&str> {
        let topic = match event_type {
            "OrderCreated" => Some(self.order_created.as_str()),
            "UserCreated" => Some(self.user_created.as_str()),
            other => self.extra.get(other).map(String::as_str),
        };

        match topic {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(MessagingError::Config(format!(
                "No topic configured for event type '{event_type}'"
            ))),
        }
    }

    /// Bind an additional event type to a topic
    pub fn with_topic(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.extra.insert(event_type.into(), topic.into());
        self
    }
}

impl MessagingSettings {
    /// Parse settings from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| MessagingError::Config(format!("Failed to parse settings: {e}")))
    }

    /// Load settings from environment variables, defaulting anything unset
    ///
    /// - `MESSAGING_BOOTSTRAP_SERVERS`: comma-separated endpoint list
    /// - `MESSAGING_CLIENT_ID`, `MESSAGING_MESSAGE_TIMEOUT_MS`
    /// - `MESSAGING_GROUP_ID`, `MESSAGING_AUTO_OFFSET_RESET`,
    ///   `MESSAGING_ENABLE_AUTO_COMMIT`, `MESSAGING_POLL_TIMEOUT_MS`
    /// - `MESSAGING_TOPIC_ORDER_CREATED`, `MESSAGING_TOPIC_USER_CREATED`
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(servers) = env::var("MESSAGING_BOOTSTRAP_SERVERS") {
            settings.bootstrap_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(client_id) = env::var("MESSAGING_CLIENT_ID") {
            settings.producer.client_id = client_id;
        }
        if let Some(ms) = env_u64("MESSAGING_MESSAGE_TIMEOUT_MS")? {
            settings.producer.message_timeout_ms = ms;
        }
        if let Ok(group_id) = env::var("MESSAGING_GROUP_ID") {
            settings.consumer.group_id = group_id;
        }
        if let Ok(reset) = env::var("MESSAGING_AUTO_OFFSET_RESET") {
            settings.consumer.auto_offset_reset = reset.parse()?;
        }
        if let Ok(auto_commit) = env::var("MESSAGING_ENABLE_AUTO_COMMIT") {
            settings.consumer.enable_auto_commit = auto_commit.parse().map_err(|_| {
                MessagingError::Config(format!(
                    "MESSAGING_ENABLE_AUTO_COMMIT must be true or false, got '{auto_commit}'"
                ))
            })?;
        }
        if let Some(ms) = env_u64("MESSAGING_POLL_TIMEOUT_MS")? {
            settings.consumer.poll_timeout_ms = ms;
        }
        if let Ok(topic) = env::var("MESSAGING_TOPIC_ORDER_CREATED") {
            settings.topics.order_created = topic;
        }
        if let Ok(topic) = env::var("MESSAGING_TOPIC_USER_CREATED") {
            settings.topics.user_created = topic;
        }

        Ok(settings)
    }

    /// Validate settings common to producers and consumers
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty()
            || self.bootstrap_servers.iter().any(|s| s.trim().is_empty())
        {
            return Err(MessagingError::Config(
                "bootstrapServers must list at least one endpoint".to_string(),
            ));
        }
        if self.producer.message_timeout_ms == 0 {
            return Err(MessagingError::Config(
                "producer.messageTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if self.consumer.poll_timeout_ms == 0 {
            return Err(MessagingError::Config(
                "consumer.pollTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if self.consumer.enable_auto_commit {
            return Err(MessagingError::Config(
                "consumer.enableAutoCommit must be false: offsets are committed after handling"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Validate settings required to run a consumer
    pub fn validate_consumer(&self) -> Result<()> {
        self.validate()?;
        if self.consumer.group_id.trim().is_empty() {
            return Err(MessagingError::Config(
                "consumer.groupId is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Endpoints joined with commas, as most client libraries expect
    pub fn bootstrap_list(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

fn env_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(v) => v.trim().parse().map(Some).map_err(|_| {
            MessagingError::Config(format!("{var} must be an unsigned integer, got '{v}'"))
        }),
        Err(_) => Ok(None),
    }
}
