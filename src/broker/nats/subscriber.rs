//! JetStream consumer: durable pull subscription with explicit acks
//!
//! The durable consumer name is derived from the group and topic, so the
//! server keeps the group's position across reconnects. Commit maps to
//! `ack`, redelivery to `nak`; the stream sequence is the offset.

use super::client::NatsConnection;
use super::KEY_HEADER;
use crate::broker::BrokerConsumer;
use crate::error::{MessagingError, Result};
use crate::types::{
    Delivery, Headers, OffsetReset, HEADER_DEAD_LETTER_REASON, HEADER_EVENT_TYPE,
    HEADER_MESSAGE_ID, HEADER_ORIGINAL_TOPIC, HEADER_PRODUCED_AT,
};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

const FORWARDED_HEADERS: [&str; 5] = [
    HEADER_EVENT_TYPE,
    HEADER_MESSAGE_ID,
    HEADER_PRODUCED_AT,
    HEADER_DEAD_LETTER_REASON,
    HEADER_ORIGINAL_TOPIC,
];

/// JetStream consumer bound to one consumer group
pub struct NatsConsumer {
    connection: NatsConnection,
    group: String,
    reset: OffsetReset,
    topic: Option<String>,
    messages: Option<Pin<Box<jetstream::consumer::pull::Stream>>>,
    /// Deliveries awaiting ack/nak, keyed by stream sequence
    pending: HashMap<u64, jetstream::Message>,
}

impl NatsConsumer {
    pub fn new(connection: NatsConnection, group: String, reset: OffsetReset) -> Self {
        Self {
            connection,
            group,
            reset,
            topic: None,
            messages: None,
            pending: HashMap::new(),
        }
    }

    /// Consumer group of this connection
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Deliveries handed out and not yet acked or nak'd
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn to_delivery(&self, msg: &jetstream::Message, sequence: u64) -> Delivery {
        let mut headers = Headers::new();
        let mut key = None;

        if let Some(map) = msg.message.headers.as_ref() {
            for name in FORWARDED_HEADERS {
                if let Some(value) = map.get(name) {
                    headers.insert(name.to_string(), value.as_str().to_string());
                }
            }
            key = map.get(KEY_HEADER).map(|v| v.as_str().to_string());
        }

        let subject = msg.message.subject.to_string();
        Delivery {
            topic: self.connection.config.topic_from_subject(&subject).to_string(),
            partition: 0,
            offset: sequence as i64,
            key,
            payload: msg.message.payload.clone(),
            headers,
        }
    }
}

#[async_trait]
impl BrokerConsumer for NatsConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let config = self.connection.config.clone();
        let durable = config.durable_name(&self.group, topic);
        let deliver_policy = match self.reset {
            OffsetReset::Earliest => jetstream::consumer::DeliverPolicy::All,
            OffsetReset::Latest => jetstream::consumer::DeliverPolicy::New,
        };

        let consumer = self
            .connection
            .stream
            .get_or_create_consumer(
                &durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: config.subject_for(topic),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(config.ack_wait_secs),
                    deliver_policy,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MessagingError::Subscribe {
                topic: topic.to_string(),
                reason: format!("failed to create durable consumer '{}': {}", durable, e),
            })?;

        let messages = consumer.messages().await.map_err(|e| MessagingError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            consumer = %durable,
            group = %self.group,
            topic = %topic,
            "Durable subscription created"
        );

        self.topic = Some(topic.to_string());
        self.messages = Some(Box::pin(messages));
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let topic = self.topic.clone().unwrap_or_default();
        let stream = self.messages.as_mut().ok_or_else(|| MessagingError::Poll {
            topic: topic.clone(),
            reason: "not subscribed".to_string(),
        })?;

        let msg = match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(MessagingError::Poll {
                    topic,
                    reason: "message stream ended".to_string(),
                })
            }
            Ok(Some(Err(e))) => {
                return Err(MessagingError::Poll {
                    topic,
                    reason: e.to_string(),
                })
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let sequence = msg
            .info()
            .map_err(|e| MessagingError::Poll {
                topic: topic.clone(),
                reason: format!("invalid delivery metadata: {}", e),
            })?
            .stream_sequence;

        let delivery = self.to_delivery(&msg, sequence);
        self.pending.insert(sequence, msg);
        Ok(Some(delivery))
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let sequence = delivery.offset as u64;
        // A failed ack drops the entry too: the server redelivers after ack_wait
        let msg = self.pending.remove(&sequence).ok_or_else(|| MessagingError::Commit {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            reason: "delivery is not pending on this consumer".to_string(),
        })?;

        msg.ack().await.map_err(|e| MessagingError::Commit {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            reason: e.to_string(),
        })
    }

    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()> {
        let sequence = delivery.offset as u64;
        let Some(msg) = self.pending.remove(&sequence) else {
            return Ok(());
        };

        if let Err(e) = msg.ack_with(jetstream::AckKind::Nak(None)).await {
            // Kept so a retried redelivery can nak it again
            self.pending.insert(sequence, msg);
            return Err(MessagingError::Poll {
                topic: delivery.topic.clone(),
                reason: format!("nak failed: {}", e),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Unacked deliveries return to the stream after ack_wait
        self.messages = None;
        self.pending.clear();
        tracing::info!(group = %self.group, topic = ?self.topic, "NATS consumer closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
