//! NATS JetStream integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available.

use commerce_events::broker::nats::{
    NatsConfig, NatsConnection, NatsConnector, NatsConsumer, StorageType,
};
use commerce_events::{
    BrokerConnector, BrokerConsumer, BrokerProducer, ConsumerOptions, EventConsumer,
    EventHandler, EventProducer, HandlerError, MessageContext, MessagingSettings, OffsetReset,
    OrderCreated, OutboundMessage, SharedFactory,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn settings(group: &str) -> MessagingSettings {
    let mut settings = MessagingSettings {
        bootstrap_servers: vec!["nats://127.0.0.1:4222".to_string()],
        ..Default::default()
    };
    settings.consumer.group_id = group.to_string();
    settings.consumer.poll_timeout_ms = 100;
    settings
}

/// Try to reach NATS. Returns None if the server is unavailable.
async fn try_nats(suffix: &str) -> Option<NatsConnector> {
    // Fresh stream per run so earlier runs' messages are never replayed
    let run = Uuid::new_v4().simple().to_string();
    let suffix = format!("{}_{}", suffix, &run[..8]);
    let connector = NatsConnector::new(NatsConfig {
        stream_name: format!("TEST_COMMERCE_{}", suffix.to_uppercase()),
        subject_prefix: format!("test.{}", suffix),
        storage: StorageType::Memory,
        max_events: 10_000,
        max_age_secs: 60,
        ack_wait_secs: 5,
        ..Default::default()
    });

    match connector.connect_producer(&settings("probe")).await {
        Ok(producer) => {
            producer.close().await.ok();
            Some(connector)
        }
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

/// Connector for the test, or skip it
macro_rules! nats_connector {
    ($suffix:expr) => {
        match try_nats($suffix).await {
            Some(c) => c,
            None => return,
        }
    };
}

fn laptop() -> OrderCreated {
    OrderCreated {
        order_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        product: "Laptop".to_string(),
        quantity: 1,
        price: 999.99,
    }
}

/// Fails its first `fail_first` invocations, then succeeds
#[derive(Default)]
struct Flaky {
    fail_first: AtomicUsize,
}

#[async_trait::async_trait]
impl EventHandler<OrderCreated> for Flaky {
    async fn handle(&self, _event: OrderCreated, _ctx: &MessageContext) -> Result<(), HandlerError> {
        let fail = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err("first attempt fails".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_nats_publish_ack() {
    let connector = nats_connector!("pub_ack");

    let producer = EventProducer::connect(&connector, &settings("pub")).await.unwrap();
    let first = producer.publish_event(&laptop()).await.unwrap();
    let second = producer.publish_event(&laptop()).await.unwrap();

    assert_eq!(first.topic, "order.created");
    assert_eq!(first.partition, 0);
    assert!(second.offset > first.offset);
    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nats_consume_and_commit() {
    let connector = nats_connector!("consume");
    let settings = settings("users");

    let producer = EventProducer::connect(&connector, &settings).await.unwrap();
    producer.publish_event(&laptop()).await.unwrap();

    let factory = SharedFactory::new(Flaky::default());
    let consumer = EventConsumer::<OrderCreated, _>::connect(&connector, &settings, factory)
        .await
        .unwrap();
    let metrics = consumer.metrics();

    let token = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(token.clone()));
    for _ in 0..100 {
        if metrics.snapshot().committed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    token.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.metrics.handled, 1);
    assert_eq!(report.metrics.committed, 1);
    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nats_nak_redelivers_failed_message() {
    let connector = nats_connector!("redeliver");
    let settings = settings("users");

    let producer = EventProducer::connect(&connector, &settings).await.unwrap();
    producer.publish_event(&laptop()).await.unwrap();

    let handler = Flaky {
        fail_first: AtomicUsize::new(1),
    };
    let consumer = EventConsumer::<OrderCreated, _>::connect(
        &connector,
        &settings,
        SharedFactory::new(handler),
    )
    .await
    .unwrap()
    .with_options(ConsumerOptions::default().with_poll_timeout(Duration::from_millis(100)));
    let metrics = consumer.metrics();

    let token = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(token.clone()));
    for _ in 0..100 {
        if metrics.snapshot().committed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    token.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.metrics.handler_failures, 1);
    assert_eq!(report.metrics.handled, 1);
    assert_eq!(report.metrics.committed, 1);
    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nats_nak_and_ack_clear_pending_deliveries() {
    let connector = nats_connector!("pending");
    let settings = settings("pending");

    let producer = connector.connect_producer(&settings).await.unwrap();
    producer
        .send(OutboundMessage::new("order.created", "k", b"{\"OrderId\": 42".to_vec()))
        .await
        .unwrap();

    let connection = NatsConnection::connect(&settings, Arc::new(connector.config().clone()))
        .await
        .unwrap();
    let mut consumer =
        NatsConsumer::new(connection, "pending".to_string(), OffsetReset::Earliest);
    consumer.subscribe("order.created").await.unwrap();

    let first = consumer.poll(Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(consumer.pending_count(), 1);
    consumer.redeliver(&first).await.unwrap();
    assert_eq!(consumer.pending_count(), 0);

    let again = consumer.poll(Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(again.offset, first.offset);
    consumer.commit(&again).await.unwrap();
    assert_eq!(consumer.pending_count(), 0);

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_nats_unreachable_server_fails_fast() {
    let connector = NatsConnector::new(NatsConfig {
        connect_timeout_secs: 1,
        ..Default::default()
    });
    let mut settings = settings("users");
    settings.bootstrap_servers = vec!["nats://127.0.0.1:1".to_string()];

    let result = EventProducer::connect(&connector, &settings).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_nats_shared_connector_is_reusable() {
    let connector = Arc::new(nats_connector!("shared"));
    let a = EventProducer::connect(connector.as_ref(), &settings("a")).await.unwrap();
    let b = EventProducer::connect(connector.as_ref(), &settings("b")).await.unwrap();

    a.publish_event(&laptop()).await.unwrap();
    b.publish_event(&laptop()).await.unwrap();

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
