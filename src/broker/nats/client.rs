//! NATS JetStream connection and producer

use super::config::{NatsConfig, StorageType};
use super::KEY_HEADER;
use crate::broker::BrokerProducer;
use crate::config::MessagingSettings;
use crate::error::{MessagingError, Result};
use crate::types::{Ack, OutboundMessage};
use async_nats::jetstream;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An established JetStream connection with its stream ensured
///
/// Each producer and consumer owns one of these; connections are never
/// shared between components.
pub struct NatsConnection {
    pub(crate) client: async_nats::Client,
    pub(crate) jetstream: jetstream::Context,
    pub(crate) stream: jetstream::stream::Stream,
    pub(crate) config: Arc<NatsConfig>,
}

impl NatsConnection {
    /// Connect to the configured servers and create the stream if needed
    pub async fn connect(settings: &MessagingSettings, config: Arc<NatsConfig>) -> Result<Self> {
        let servers = settings.bootstrap_list();
        let client = build_connect_options(&config, &settings.producer.client_id)
            .connect(&servers)
            .await
            .map_err(|e| MessagingError::Connection(format!("{}: {}", servers, e)))?;

        tracing::info!(servers = %servers, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream,
            config,
        })
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// JetStream producer
///
/// The stream sequence number is reported as the offset; JetStream has no
/// partitions, so every ack reports partition 0.
pub struct NatsProducer {
    connection: NatsConnection,
    message_timeout: Duration,
    closed: AtomicBool,
}

impl NatsProducer {
    /// Connect a producer
    pub async fn connect(settings: &MessagingSettings, config: Arc<NatsConfig>) -> Result<Self> {
        settings.validate()?;
        let connection = NatsConnection::connect(settings, config).await?;
        Ok(Self {
            connection,
            message_timeout: settings.producer.message_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &NatsConnection {
        &self.connection
    }
}

#[async_trait]
impl BrokerProducer for NatsProducer {
    async fn send(&self, message: OutboundMessage) -> Result<Ack> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed("nats producer".to_string()));
        }

        let subject = self.connection.config.subject_for(&message.topic);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(KEY_HEADER, message.key.as_str());
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack_fut = self
            .connection
            .jetstream
            .publish_with_headers(subject, headers, message.payload)
            .await
            .map_err(|e| MessagingError::Publish {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;

        let ack = tokio::time::timeout(self.message_timeout, ack_fut)
            .await
            .map_err(|_| {
                MessagingError::Timeout(format!(
                    "Publish ack timed out after {:?} for topic '{}'",
                    self.message_timeout, message.topic
                ))
            })?
            .map_err(|e| MessagingError::Publish {
                topic: message.topic.clone(),
                reason: format!("ack failed: {}", e),
            })?;

        Ok(Ack {
            topic: message.topic,
            partition: 0,
            offset: ack.sequence as i64,
        })
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.connection.client.flush())
            .await
            .map_err(|_| MessagingError::Timeout(format!("NATS flush exceeded {:?}", timeout)))?
            .map_err(|e| MessagingError::Connection(format!("NATS flush failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig, client_name: &str) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .name(client_name)
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            MessagingError::Connection(format!(
                "Failed to create/get stream '{}': {}",
                config.stream_name, e
            ))
        })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}
