//! NATS JetStream adapter configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Persist to disk
    #[default]
    File,
    /// Keep in memory only
    Memory,
}

/// Stream and connection options for the JetStream adapter
///
/// Broker endpoints and consumer group come from `MessagingSettings`;
/// this struct only carries what is JetStream specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Stream holding every topic
    pub stream_name: String,

    /// Prefix prepended to topic names to form subjects
    pub subject_prefix: String,

    /// Storage backend
    pub storage: StorageType,

    /// Maximum messages retained (-1 = unlimited)
    pub max_events: i64,

    /// Maximum bytes retained (-1 = unlimited)
    pub max_bytes: i64,

    /// Maximum message age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Seconds before an unacknowledged delivery is resent by the server
    pub ack_wait_secs: u64,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Auth token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            stream_name: "COMMERCE_EVENTS".to_string(),
            subject_prefix: "commerce".to_string(),
            storage: StorageType::File,
            max_events: 100_000,
            max_bytes: -1,
            max_age_secs: 604_800,
            ack_wait_secs: 30,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            token: None,
        }
    }
}

impl NatsConfig {
    /// Subject a topic is published on
    pub fn subject_for(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, topic)
    }

    /// Topic name recovered from a subject
    pub fn topic_from_subject<'a>(&self, subject: &'a str) -> &'a str {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(subject)
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }

    /// Durable consumer name for a (group, topic) pair
    pub fn durable_name(&self, group: &str, topic: &str) -> String {
        format!("{}-{}", group, topic.replace('.', "-"))
    }
}
