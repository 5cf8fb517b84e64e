//! Broker client adapters: the transport seam under producers and consumers
//!
//! Every backend (in-memory, NATS JetStream, Kafka) implements
//! `BrokerProducer` for produce-with-ack and `BrokerConsumer` for
//! subscribe, poll, commit and redelivery. Consumers never auto-commit:
//! the consumer loop commits explicitly once a message has been handled.

use crate::config::MessagingSettings;
use crate::error::Result;
use crate::types::{Ack, Delivery, OutboundMessage};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod nats;

/// Producing half of a broker connection
///
/// Implementations must be safe to share between concurrent callers.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Send a message and wait for the broker acknowledgment
    async fn send(&self, message: OutboundMessage) -> Result<Ack>;

    /// Wait (up to `timeout`) for in-flight messages to be acknowledged
    async fn flush(&self, timeout: Duration) -> Result<()>;

    /// Release the connection; later sends fail with `Closed`
    async fn close(&self) -> Result<()>;

    /// Backend name (e.g., "memory", "nats", "kafka")
    fn name(&self) -> &str;
}

/// Consuming half of a broker connection, owned by exactly one consumer loop
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Subscribe to a topic using the group configured at creation
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Wait up to `timeout` for the next message
    ///
    /// Returns `Ok(None)` when the timeout elapses without a message.
    /// Must be cancel-safe: dropping the future loses no message.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Commit the group offset past `delivery`
    async fn commit(&mut self, delivery: &Delivery) -> Result<()>;

    /// Re-present `delivery` on the next poll without committing it
    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()>;

    /// Release the subscription and close the connection
    async fn close(&mut self) -> Result<()>;

    /// Backend name (e.g., "memory", "nats", "kafka")
    fn name(&self) -> &str;
}

/// Opens broker connections from settings
///
/// Consumer factories hold a connector so each consumer loop acquires its
/// own exclusively owned connection.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a producer connection
    async fn connect_producer(&self, settings: &MessagingSettings) -> Result<Box<dyn BrokerProducer>>;

    /// Open a consumer connection for `settings.consumer.group_id`
    async fn connect_consumer(&self, settings: &MessagingSettings) -> Result<Box<dyn BrokerConsumer>>;
}

#[async_trait]
impl<P: BrokerProducer + ?Sized> BrokerProducer for Box<P> {
    async fn send(&self, message: OutboundMessage) -> Result<Ack> {
        (**self).send(message).await
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        (**self).flush(timeout).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<C: BrokerConsumer + ?Sized> BrokerConsumer for Box<C> {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        (**self).subscribe(topic).await
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        (**self).poll(timeout).await
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        (**self).commit(delivery).await
    }

    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()> {
        (**self).redeliver(delivery).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
