//! # commerce-events
//!
//! Typed event publishing and an at-least-once consumer loop for the orders
//! and users services.
//!
//! ## Overview
//!
//! `commerce-events` connects independently deployed services through a
//! message broker. Producers publish domain events and wait for the broker
//! acknowledgment. Each consumer is bound to one topic and one event type,
//! resolves a fresh handler per message and commits the offset only after
//! the handler succeeded.
//!
//! ## Quick Start
//!
//! ```rust
//! use commerce_events::broker::memory::MemoryBroker;
//! use commerce_events::{
//!     EventConsumer, EventHandler, EventProducer, FnFactory, HandlerError, MessageContext,
//!     MessagingSettings, OrderCreated,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct PrintOrder;
//!
//! #[async_trait::async_trait]
//! impl EventHandler<OrderCreated> for PrintOrder {
//!     async fn handle(&self, event: OrderCreated, _ctx: &MessageContext) -> Result<(), HandlerError> {
//!         println!("order {} for {}", event.order_id, event.product);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> commerce_events::Result<()> {
//! let broker = MemoryBroker::default();
//! let mut settings = MessagingSettings::default();
//! settings.consumer.group_id = "user-service".to_string();
//!
//! let producer = EventProducer::connect(&broker, &settings).await?;
//! let consumer =
//!     EventConsumer::<OrderCreated, _>::connect(&broker, &settings, FnFactory::new(|| PrintOrder))
//!         .await?;
//!
//! let shutdown = CancellationToken::new();
//! let task = tokio::spawn(consumer.run(shutdown.clone()));
//!
//! producer
//!     .publish_event(&OrderCreated {
//!         order_id: uuid::Uuid::new_v4(),
//!         user_id: uuid::Uuid::new_v4(),
//!         product: "Laptop".to_string(),
//!         quantity: 1,
//!         price: 999.99,
//!     })
//!     .await?;
//!
//! shutdown.cancel();
//! let _report = task.await.expect("consumer task");
//! producer.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Brokers
//!
//! - **memory**: in-process broker for tests and single-process wiring
//! - **nats**: NATS JetStream with durable pull consumers
//! - **kafka**: Kafka via librdkafka (cargo feature `kafka`)
//!
//! ## Delivery contract
//!
//! - A message is committed if and only if its handler returned `Ok`
//! - A failed handler leaves the message uncommitted and it is presented
//!   again on the next poll
//! - A payload that cannot be decoded is never handed to a handler
//! - Cancellation is a clean exit, never a processing failure

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod handler;
pub mod host;
pub mod idempotency;
pub mod metrics;
pub mod producer;
pub mod services;
pub mod types;

// Re-export core types
pub use broker::{BrokerConnector, BrokerConsumer, BrokerProducer};
pub use config::{ConsumerSettings, MessagingSettings, ProducerSettings, TopicSettings};
pub use consumer::{ConsumerOptions, ConsumerReport, ConsumerState, EventConsumer, RetryPolicy};
pub use dead_letter::{
    DeadLetter, DeadLetterPolicy, DeadLetterSink, MemoryDeadLetterQueue, TopicDeadLetterSink,
};
pub use error::{HandlerError, MessagingError, Result};
pub use events::{OrderCreated, UserCreated};
pub use handler::{EventHandler, FnFactory, HandlerFactory, MessageContext, SharedFactory};
pub use host::{ConsumerHost, ShutdownReport};
pub use idempotency::{FileIdempotencyStore, IdempotencyStore, MemoryIdempotencyStore};
pub use metrics::{
    ConsumerMetrics, ConsumerMetricsSnapshot, ProducerMetrics, ProducerMetricsSnapshot,
};
pub use producer::EventProducer;
pub use types::{Ack, Delivery, Event, Headers, OffsetReset, OutboundMessage};

// Re-export brokers for convenience
pub use broker::memory::{MemoryBroker, MemoryConfig};
pub use broker::nats::{NatsConfig, NatsConnector, StorageType};
