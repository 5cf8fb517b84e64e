//! NATS JetStream broker adapter
//!
//! Topics map to subjects under a common prefix inside one stream. Consumer
//! groups map to durable pull consumers, so committed positions survive
//! restarts. JetStream has no partitions: per-topic order is the stream
//! order, and the partition key travels in a header.

mod client;
mod config;
mod subscriber;

pub use client::{NatsConnection, NatsProducer};
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsConsumer;

use crate::broker::{BrokerConnector, BrokerConsumer, BrokerProducer};
use crate::config::MessagingSettings;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Header carrying the partition key on NATS messages
pub const KEY_HEADER: &str = "Commerce-Key";

/// Opens JetStream producer and consumer connections
#[derive(Clone, Default)]
pub struct NatsConnector {
    config: Arc<NatsConfig>,
}

impl NatsConnector {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the JetStream configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect_producer(&self, settings: &MessagingSettings) -> Result<Box<dyn BrokerProducer>> {
        let producer = NatsProducer::connect(settings, self.config.clone()).await?;
        Ok(Box::new(producer))
    }

    async fn connect_consumer(&self, settings: &MessagingSettings) -> Result<Box<dyn BrokerConsumer>> {
        settings.validate_consumer()?;
        let connection = NatsConnection::connect(settings, self.config.clone()).await?;
        Ok(Box::new(NatsConsumer::new(
            connection,
            settings.consumer.group_id.clone(),
            settings.consumer.auto_offset_reset,
        )))
    }
}
