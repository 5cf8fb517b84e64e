//! Kafka broker adapter (cargo feature `kafka`, requires librdkafka)
//!
//! Producers wait for the partition leader's acknowledgment (`acks=1`).
//! Consumers run with `enable.auto.commit=false`; commits are synchronous
//! and point past the handled message. Redelivery seeks the partition back
//! to the failed offset so the next poll returns it again.

use super::{BrokerConnector, BrokerConsumer, BrokerProducer};
use crate::config::MessagingSettings;
use crate::error::{MessagingError, Result};
use crate::types::{Ack, Delivery, Headers, OutboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::info;

/// Kafka producer with leader acknowledgment
pub struct KafkaProducer {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaProducer {
    /// Create a producer; fails fast on invalid client configuration
    pub fn new(settings: &MessagingSettings) -> Result<Self> {
        settings.validate()?;
        let servers = settings.bootstrap_list();

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .set("client.id", &settings.producer.client_id)
            .set(
                "message.timeout.ms",
                settings.producer.message_timeout_ms.to_string(),
            )
            .set("acks", "1")
            .create()
            .map_err(|e| MessagingError::Connection(format!("{}: {}", servers, e)))?;

        info!(
            bootstrap_servers = %servers,
            client_id = %settings.producer.client_id,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            message_timeout: settings.producer.message_timeout(),
        })
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, message: OutboundMessage) -> Result<Ack> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(message.key.as_str())
            .payload(message.payload.as_ref())
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.message_timeout)
            .await
            .map_err(|(err, _)| MessagingError::Publish {
                topic: message.topic.clone(),
                reason: err.to_string(),
            })?;

        Ok(Ack {
            topic: message.topic,
            partition,
            offset,
        })
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(timeout)
            .map_err(|e| MessagingError::Timeout(format!("Kafka flush failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        // librdkafka tears the connection down when the producer is dropped
        Ok(())
    }

    fn name(&self) -> &str {
        "kafka"
    }
}

/// Kafka consumer with manual commits
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    group: String,
    topic: Option<String>,
    closed: bool,
}

impl KafkaConsumer {
    /// Create a consumer for `settings.consumer.group_id`
    pub fn new(settings: &MessagingSettings) -> Result<Self> {
        settings.validate_consumer()?;
        let servers = settings.bootstrap_list();
        let group = settings.consumer.group_id.clone();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .set("client.id", &settings.producer.client_id)
            .set("group.id", &group)
            .set("auto.offset.reset", settings.consumer.auto_offset_reset.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                settings.consumer.session_timeout_ms.to_string(),
            )
            .create()
            .map_err(|e| MessagingError::Connection(format!("{}: {}", servers, e)))?;

        info!(
            group_id = %group,
            bootstrap_servers = %servers,
            auto_offset_reset = %settings.consumer.auto_offset_reset,
            "Kafka consumer created"
        );

        Ok(Self {
            consumer,
            group,
            topic: None,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(MessagingError::Closed(format!("kafka consumer '{}'", self.group)))
        } else {
            Ok(())
        }
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let mut headers = Headers::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    Delivery {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        headers,
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| MessagingError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.topic = Some(topic.to_string());
        info!(group_id = %self.group, topic = %topic, "Subscribed to topic");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(to_delivery(&message))),
            Ok(Err(e)) => Err(MessagingError::Poll {
                topic: self.topic.clone().unwrap_or_default(),
                reason: e.to_string(),
            }),
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        let commit_err = |reason: String| MessagingError::Commit {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            reason,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &delivery.topic,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        )
        .map_err(|e| commit_err(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| commit_err(e.to_string()))
    }

    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        self.consumer
            .seek(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset),
                Duration::from_secs(5),
            )
            .map_err(|e| MessagingError::Poll {
                topic: delivery.topic.clone(),
                reason: format!("seek to {} failed: {}", delivery.offset, e),
            })
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.consumer.unsubscribe();
            self.closed = true;
            info!(group_id = %self.group, topic = ?self.topic, "Kafka consumer closed");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "kafka"
    }
}

/// Opens Kafka producer and consumer connections
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaConnector;

#[async_trait]
impl BrokerConnector for KafkaConnector {
    async fn connect_producer(&self, settings: &MessagingSettings) -> Result<Box<dyn BrokerProducer>> {
        Ok(Box::new(KafkaProducer::new(settings)?))
    }

    async fn connect_consumer(&self, settings: &MessagingSettings) -> Result<Box<dyn BrokerConsumer>> {
        Ok(Box::new(KafkaConsumer::new(settings)?))
    }
}
