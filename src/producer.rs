//! Typed event producer
//!
//! `EventProducer` owns one broker producer connection for the life of the
//! process and is shared (behind an `Arc`) by every caller that publishes.
//! A successful `publish` means the broker acknowledged the message.
//! Failures are returned to the caller; business code catches and logs
//! them so event emission never aborts the write that triggered it.

use crate::broker::{BrokerConnector, BrokerProducer};
use crate::config::{MessagingSettings, ProducerSettings, TopicSettings};
use crate::error::{MessagingError, Result};
use crate::metrics::ProducerMetrics;
use crate::types::{
    Ack, Event, OutboundMessage, HEADER_EVENT_TYPE, HEADER_MESSAGE_ID, HEADER_PRODUCED_AT,
};
use chrono::{SecondsFormat, Utc};
use tracing::instrument;
use uuid::Uuid;

/// Publishes typed events to the broker
pub struct EventProducer {
    producer: Box<dyn BrokerProducer>,
    settings: ProducerSettings,
    topics: TopicSettings,
    metrics: ProducerMetrics,
}

impl EventProducer {
    /// Wrap an already-open broker producer
    pub fn new(producer: impl BrokerProducer + 'static, settings: &MessagingSettings) -> Self {
        Self::from_boxed(Box::new(producer), settings)
    }

    /// Open a producer connection through `connector`
    ///
    /// Fails fast on invalid settings or an unreachable broker.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        settings: &MessagingSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let producer = connector.connect_producer(settings).await?;

        tracing::info!(
            backend = producer.name(),
            bootstrap_servers = %settings.bootstrap_list(),
            client_id = %settings.producer.client_id,
            "Event producer connected"
        );

        Ok(Self::from_boxed(producer, settings))
    }

    fn from_boxed(producer: Box<dyn BrokerProducer>, settings: &MessagingSettings) -> Self {
        Self {
            producer,
            settings: settings.producer.clone(),
            topics: settings.topics.clone(),
            metrics: ProducerMetrics::default(),
        }
    }

    /// Publish an event to `topic` with partition key `key`
    ///
    /// Returns once the broker acknowledges the write, or fails after the
    /// configured message timeout.
    #[instrument(skip(self, event), fields(event_type = %E::EVENT_TYPE))]
    pub async fn publish<E: Event>(&self, topic: &str, key: &str, event: &E) -> Result<Ack> {
        match self.send(topic, key, event).await {
            Ok(ack) => {
                tracing::info!(
                    topic = %ack.topic,
                    partition = ack.partition,
                    offset = ack.offset,
                    event_type = E::EVENT_TYPE,
                    "Event published"
                );
                Ok(ack)
            }
            Err(e) => {
                self.metrics.record_failure();
                tracing::error!(
                    topic = %topic,
                    key = %key,
                    event_type = E::EVENT_TYPE,
                    error = %e,
                    "Failed to publish event"
                );
                Err(e)
            }
        }
    }

    /// Publish an event to the topic configured for its type, keyed by
    /// its partition key
    pub async fn publish_event<E: Event>(&self, event: &E) -> Result<Ack> {
        let topic = self.topics.topic_for(E::EVENT_TYPE)?.to_string();
        let key = event.partition_key();
        self.publish(&topic, &key, event).await
    }

    async fn send<E: Event>(&self, topic: &str, key: &str, event: &E) -> Result<Ack> {
        if topic.trim().is_empty() {
            return Err(MessagingError::Publish {
                topic: topic.to_string(),
                reason: "topic name is empty".to_string(),
            });
        }

        let payload = serde_json::to_vec(event)?;
        let size = payload.len();
        let message = OutboundMessage::new(topic, key, payload)
            .with_header(HEADER_EVENT_TYPE, E::EVENT_TYPE)
            .with_header(HEADER_MESSAGE_ID, Uuid::new_v4().to_string())
            .with_header(
                HEADER_PRODUCED_AT,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            );

        tracing::debug!(topic = %topic, key = %key, payload_size = size, "Publishing event");

        let timeout = self.settings.message_timeout();
        let ack = tokio::time::timeout(timeout, self.producer.send(message))
            .await
            .map_err(|_| {
                MessagingError::Timeout(format!(
                    "No acknowledgment for '{topic}' within {}ms",
                    timeout.as_millis()
                ))
            })??;

        self.metrics.record_published(size);
        Ok(ack)
    }

    /// Flush in-flight messages (bounded by the flush timeout), then close
    ///
    /// Call once at process shutdown; later publishes fail.
    pub async fn shutdown(&self) -> Result<()> {
        let flush_timeout = self.settings.flush_timeout();
        if let Err(e) = self.producer.flush(flush_timeout).await {
            tracing::warn!(error = %e, "Producer flush did not complete before close");
        }
        self.producer.close().await?;

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            published = snapshot.published,
            publish_failures = snapshot.publish_failures,
            "Event producer closed"
        );
        Ok(())
    }

    /// Producer counters
    pub fn metrics(&self) -> &ProducerMetrics {
        &self.metrics
    }

    /// Backend name of the underlying broker producer
    pub fn backend(&self) -> &str {
        self.producer.name()
    }

    /// Topic map used by `publish_event`
    pub fn topics(&self) -> &TopicSettings {
        &self.topics
    }
}
