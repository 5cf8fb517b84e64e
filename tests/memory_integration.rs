//! Memory broker integration tests
//!
//! End-to-end tests exercising the producer and the consumer loop against
//! the in-memory broker. Covers commit ordering, handler failures,
//! undecodable payloads, dead-lettering, duplicate suppression, shutdown,
//! and the orders/users services wired together.

use commerce_events::broker::memory::{JournalEntry, MemoryBroker, MemoryConfig};
use commerce_events::services::{
    NewOrder, NewUser, OrderCreatedHandler, OrderRepository, OrderService, UserCreatedHandler,
    UserRefStore, UserRepository, UserService,
};
use commerce_events::{
    ConsumerHost, ConsumerOptions, ConsumerReport, ConsumerState, DeadLetterPolicy,
    EventConsumer, EventHandler, EventProducer, FnFactory, HandlerError, HandlerFactory,
    MemoryDeadLetterQueue, MemoryIdempotencyStore, MessageContext, MessagingSettings,
    OffsetReset, OrderCreated, RetryPolicy, TopicDeadLetterSink, UserCreated,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const GROUP: &str = "user-service";
const TOPIC: &str = "order.created";

// ─── Helpers ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Seen {
    event: OrderCreated,
    offset: i64,
    attempt: u32,
    at: Instant,
}

/// Handler that records every invocation and fails while `failures_left`
/// is positive
#[derive(Clone)]
struct Recorder {
    broker: MemoryBroker,
    seen: Arc<Mutex<Vec<Seen>>>,
    failures_left: Arc<AtomicUsize>,
    premature_commits: Arc<AtomicUsize>,
    resolved: Arc<AtomicUsize>,
}

impl Recorder {
    fn new(broker: &MemoryBroker) -> Self {
        Self {
            broker: broker.clone(),
            seen: Arc::new(Mutex::new(Vec::new())),
            failures_left: Arc::new(AtomicUsize::new(0)),
            premature_commits: Arc::new(AtomicUsize::new(0)),
            resolved: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(broker: &MemoryBroker, failures: usize) -> Self {
        let recorder = Self::new(broker);
        recorder.failures_left.store(failures, Ordering::SeqCst);
        recorder
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn factory(&self) -> impl HandlerFactory<OrderCreated> {
        let recorder = self.clone();
        FnFactory::new(move || {
            recorder.resolved.fetch_add(1, Ordering::SeqCst);
            recorder.clone()
        })
    }
}

#[async_trait::async_trait]
impl EventHandler<OrderCreated> for Recorder {
    async fn handle(&self, event: OrderCreated, ctx: &MessageContext) -> Result<(), HandlerError> {
        let committed = self
            .broker
            .committed_offset(GROUP, &ctx.topic, ctx.partition)
            .await
            .unwrap_or(0);
        if committed > ctx.offset {
            self.premature_commits.fetch_add(1, Ordering::SeqCst);
        }

        self.seen.lock().unwrap().push(Seen {
            event,
            offset: ctx.offset,
            attempt: ctx.attempt,
            at: Instant::now(),
        });

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err("handler failure".into());
        }
        Ok(())
    }
}

/// Route consumer logs to the test output; set RUST_LOG to see them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_options() -> ConsumerOptions {
    ConsumerOptions::default()
        .with_poll_timeout(Duration::from_millis(20))
        .with_poll_error_backoff(Duration::from_millis(10))
}

fn order_consumer<F: HandlerFactory<OrderCreated>>(
    broker: &MemoryBroker,
    factory: F,
    options: ConsumerOptions,
) -> EventConsumer<OrderCreated, F> {
    init_tracing();
    EventConsumer::new(
        broker.consumer(GROUP, OffsetReset::Earliest),
        TOPIC,
        GROUP,
        factory,
    )
    .with_options(options)
}

fn start<F: HandlerFactory<OrderCreated>>(
    consumer: EventConsumer<OrderCreated, F>,
) -> (CancellationToken, JoinHandle<commerce_events::Result<ConsumerReport>>) {
    let token = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(token.clone()));
    (token, handle)
}

async fn stop(
    token: CancellationToken,
    handle: JoinHandle<commerce_events::Result<ConsumerReport>>,
) -> ConsumerReport {
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("consumer did not stop")
        .expect("consumer task panicked")
        .expect("consumer failed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

async fn wait_for_commits(
    broker: &MemoryBroker,
    group: &str,
    n: usize,
) -> Vec<(String, i32, i64)> {
    for _ in 0..500 {
        let commits = broker.commits(group).await;
        if commits.len() >= n {
            return commits;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} commits within 5s");
}

fn order(product: &str) -> OrderCreated {
    OrderCreated {
        order_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        product: product.to_string(),
        quantity: 1,
        price: 10.0,
    }
}

fn producer(broker: &MemoryBroker) -> EventProducer {
    EventProducer::new(broker.producer(), &MessagingSettings::default())
}

fn single_partition() -> MemoryBroker {
    MemoryBroker::new(MemoryConfig { partitions: 1 })
}

// ─── Commit ordering ─────────────────────────────────────────────

#[tokio::test]
async fn test_each_handled_message_committed_once_after_handler() {
    let broker = single_partition();
    let producer = producer(&broker);
    for i in 0..5 {
        producer.publish_event(&order(&format!("item-{i}"))).await.unwrap();
    }

    let recorder = Recorder::new(&broker);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));

    let commits = wait_for_commits(&broker, GROUP, 5).await;
    let report = stop(token, handle).await;

    let offsets: Vec<i64> = commits.iter().map(|(_, _, offset)| *offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    assert_eq!(recorder.count(), 5);
    assert_eq!(recorder.premature_commits.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.resolved.load(Ordering::SeqCst), 5);
    assert_eq!(report.metrics.handled, 5);
    assert_eq!(report.metrics.committed, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_handler_never_commits_and_message_is_represented() {
    let broker = single_partition();
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    let recorder = Recorder::failing(&broker, usize::MAX);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));

    wait_until(|| recorder.count() >= 3).await;
    let report = stop(token, handle).await;

    let seen = recorder.seen();
    assert!(seen.iter().all(|s| s.offset == 0));
    let attempts: Vec<u32> = seen.iter().map(|s| s.attempt).take(3).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(broker.commits(GROUP).await.is_empty());
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0).await, None);
    assert!(report.metrics.handler_failures >= 3);
    assert_eq!(report.metrics.committed, 0);
}

#[tokio::test]
async fn test_fail_then_succeed_commits_only_after_success() {
    let broker = single_partition();
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    let recorder = Recorder::failing(&broker, 1);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));

    wait_for_commits(&broker, GROUP, 1).await;
    stop(token, handle).await;

    assert_eq!(recorder.count(), 2);
    assert_eq!(recorder.premature_commits.load(Ordering::SeqCst), 0);

    let journal: Vec<JournalEntry> = broker
        .journal()
        .await
        .into_iter()
        .filter(|entry| !matches!(entry, JournalEntry::Produced { .. }))
        .collect();
    let delivered = |offset| JournalEntry::Delivered {
        group: GROUP.to_string(),
        topic: TOPIC.to_string(),
        partition: 0,
        offset,
    };
    assert_eq!(
        journal,
        vec![
            delivered(0),
            JournalEntry::Redelivered {
                group: GROUP.to_string(),
                topic: TOPIC.to_string(),
                partition: 0,
                offset: 0,
            },
            delivered(0),
            JournalEntry::Committed {
                group: GROUP.to_string(),
                topic: TOPIC.to_string(),
                partition: 0,
                offset: 0,
            },
        ]
    );
}

#[tokio::test]
async fn test_retry_backoff_delays_redelivery() {
    let broker = single_partition();
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    let recorder = Recorder::failing(&broker, 1);
    let options =
        fast_options().with_retry(RetryPolicy::with_backoff([Duration::from_millis(150)]));
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), options));

    wait_for_commits(&broker, GROUP, 1).await;
    stop(token, handle).await;

    let seen = recorder.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].at - seen[0].at >= Duration::from_millis(150));
}

// ─── Undecodable payloads ────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undecodable_payload_is_held_back_and_never_committed() {
    let broker = single_partition();
    broker.inject(TOPIC, "bad", b"{\"OrderId\": 42".to_vec()).await;
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    let recorder = Recorder::new(&broker);
    let options = fast_options().with_retry(RetryPolicy::with_backoff([Duration::from_millis(5)]));
    let consumer = order_consumer(&broker, recorder.factory(), options);
    let metrics = consumer.metrics();
    let (token, handle) = start(consumer);

    wait_until(|| metrics.snapshot().deserialization_failures >= 3).await;
    let report = stop(token, handle).await;

    // The partition never moves past the bad offset, so the valid message
    // behind it is not reached either
    assert_eq!(recorder.count(), 0);
    assert_eq!(recorder.resolved.load(Ordering::SeqCst), 0);
    assert!(broker.commits(GROUP).await.is_empty());
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0).await, None);
    assert_eq!(report.metrics.committed, 0);

    let delivered: Vec<i64> = broker
        .journal()
        .await
        .into_iter()
        .filter_map(|entry| match entry {
            JournalEntry::Delivered { offset, .. } => Some(offset),
            _ => None,
        })
        .collect();
    assert!(delivered.len() >= 3);
    assert!(delivered.iter().all(|offset| *offset == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undecodable_payload_presented_again_after_restart() {
    let broker = single_partition();
    broker.inject(TOPIC, "bad", b"{\"OrderId\": 42".to_vec()).await;
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    for _ in 0..2 {
        let recorder = Recorder::new(&broker);
        let options =
            fast_options().with_retry(RetryPolicy::with_backoff([Duration::from_millis(5)]));
        let consumer = order_consumer(&broker, recorder.factory(), options);
        let metrics = consumer.metrics();
        let (token, handle) = start(consumer);

        wait_until(|| metrics.snapshot().deserialization_failures >= 1).await;
        let report = stop(token, handle).await;

        assert!(report.metrics.deserialization_failures >= 1);
        assert_eq!(recorder.count(), 0);
        assert_eq!(broker.committed_offset(GROUP, TOPIC, 0).await, None);
    }
}

// ─── Dead-lettering ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_message_is_dead_lettered_then_committed() {
    let broker = single_partition();
    let event = order("Laptop");
    producer(&broker).publish_event(&event).await.unwrap();

    let dlq = Arc::new(MemoryDeadLetterQueue::default());
    let options = fast_options()
        .with_dead_letter(DeadLetterPolicy::new(dlq.clone()).with_max_attempts(3));
    let recorder = Recorder::failing(&broker, usize::MAX);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), options));

    wait_for_commits(&broker, GROUP, 1).await;
    let report = stop(token, handle).await;

    assert_eq!(recorder.count(), 3);
    assert_eq!(dlq.count().await, 1);
    let letters = dlq.list(1).await;
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].event_type, "OrderCreated");
    assert_eq!(letters[0].delivery.key.as_deref(), Some(event.order_id.to_string().as_str()));
    assert_eq!(report.metrics.dead_lettered, 1);
}

#[tokio::test]
async fn test_undecodable_payload_dead_lettered_to_topic() {
    let broker = single_partition();
    broker.inject(TOPIC, "bad", b"garbage".to_vec()).await;
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    let sink = Arc::new(TopicDeadLetterSink::new(Arc::new(broker.producer())));
    let options = fast_options().with_dead_letter(DeadLetterPolicy::new(sink));
    let recorder = Recorder::new(&broker);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), options));

    let commits = wait_for_commits(&broker, GROUP, 2).await;
    stop(token, handle).await;

    assert_eq!(
        commits,
        vec![(TOPIC.to_string(), 0, 0), (TOPIC.to_string(), 0, 1)]
    );
    assert_eq!(recorder.count(), 1);
    assert_eq!(recorder.seen()[0].offset, 1);
    let dead = broker.records("order.created.dlq", 0).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(&dead[0].1[..], b"garbage");
}

// ─── Duplicate suppression ───────────────────────────────────────

#[tokio::test]
async fn test_redelivered_duplicate_skipped_with_idempotency_store() {
    let broker = single_partition();
    let producer = producer(&broker);
    let event = order("Laptop");
    producer.publish_event(&event).await.unwrap();
    producer.publish_event(&event).await.unwrap();

    let store = Arc::new(MemoryIdempotencyStore::new());
    let recorder = Recorder::new(&broker);
    let options = fast_options().with_idempotency(store.clone());
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), options));

    wait_for_commits(&broker, GROUP, 2).await;
    let report = stop(token, handle).await;

    assert_eq!(recorder.count(), 1);
    assert_eq!(report.metrics.duplicates_skipped, 1);
    assert_eq!(store.len(GROUP).await, 1);
}

// ─── Transport errors ────────────────────────────────────────────

#[tokio::test]
async fn test_failed_redelivery_never_commits_past_the_failed_offset() {
    let broker = single_partition();
    let producer = producer(&broker);
    producer.publish_event(&order("first")).await.unwrap();
    producer.publish_event(&order("second")).await.unwrap();
    broker.fail_next_redelivers(3);

    let recorder = Recorder::failing(&broker, 1);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));

    let commits = wait_for_commits(&broker, GROUP, 2).await;
    let report = stop(token, handle).await;

    assert_eq!(
        commits,
        vec![(TOPIC.to_string(), 0, 0), (TOPIC.to_string(), 0, 1)]
    );
    let offsets: Vec<i64> = recorder.seen().iter().map(|s| s.offset).collect();
    assert_eq!(offsets, vec![0, 0, 1]);
    assert_eq!(recorder.premature_commits.load(Ordering::SeqCst), 0);
    assert_eq!(report.metrics.redeliver_errors, 3);
}

#[tokio::test]
async fn test_poll_errors_do_not_stop_the_loop() {
    let broker = single_partition();
    broker.fail_next_polls(3);
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    let recorder = Recorder::new(&broker);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));

    wait_for_commits(&broker, GROUP, 1).await;
    let report = stop(token, handle).await;

    assert_eq!(report.metrics.poll_errors, 3);
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn test_commit_failure_is_logged_and_loop_continues() {
    let broker = single_partition();
    broker.fail_next_commits(1);
    let producer = producer(&broker);
    producer.publish_event(&order("first")).await.unwrap();
    producer.publish_event(&order("second")).await.unwrap();

    let recorder = Recorder::new(&broker);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));

    let commits = wait_for_commits(&broker, GROUP, 1).await;
    let report = stop(token, handle).await;

    assert_eq!(commits, vec![(TOPIC.to_string(), 0, 1)]);
    assert_eq!(recorder.count(), 2);
    assert_eq!(report.metrics.commit_errors, 1);
}

// ─── End-to-end scenarios ────────────────────────────────────────

#[tokio::test]
async fn test_order_created_end_to_end() {
    let broker = MemoryBroker::default();
    let event = OrderCreated {
        order_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        product: "Laptop".to_string(),
        quantity: 1,
        price: 999.99,
    };
    let ack = producer(&broker)
        .publish(TOPIC, &event.order_id.to_string(), &event)
        .await
        .unwrap();

    let recorder = Recorder::new(&broker);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));

    wait_for_commits(&broker, GROUP, 1).await;
    // Several more empty poll cycles
    tokio::time::sleep(Duration::from_millis(150)).await;
    let report = stop(token, handle).await;

    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event, event);
    assert_eq!(
        broker.commits(GROUP).await,
        vec![(TOPIC.to_string(), ack.partition, ack.offset)]
    );
    assert_eq!(report.metrics.received, 1);
}

#[tokio::test]
async fn test_restart_resumes_from_committed_offset() {
    let broker = single_partition();
    let producer = producer(&broker);
    producer.publish_event(&order("first")).await.unwrap();

    let recorder = Recorder::new(&broker);
    let (token, handle) = start(order_consumer(&broker, recorder.factory(), fast_options()));
    wait_for_commits(&broker, GROUP, 1).await;
    stop(token, handle).await;

    producer.publish_event(&order("second")).await.unwrap();
    let restarted = Recorder::new(&broker);
    let (token, handle) = start(order_consumer(&broker, restarted.factory(), fast_options()));
    wait_for_commits(&broker, GROUP, 2).await;
    stop(token, handle).await;

    let seen = restarted.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event.product, "second");
}

#[tokio::test]
async fn test_publish_failure_does_not_abort_business_write() {
    let broker = MemoryBroker::default();
    broker.set_unavailable(true);
    let producer = Arc::new(producer(&broker));

    let users = UserRepository::default();
    let user_service = UserService::new(users.clone(), producer.clone());
    let user = tokio_test::assert_ok!(
        user_service
            .create_user(NewUser {
                name: "Ada".into(),
                email: "ada@example.com".into(),
            })
            .await
    );
    assert!(users.exists(user.id).await);

    let refs = UserRefStore::default();
    refs.upsert(commerce_events::services::UserRef {
        user_id: user.id,
        name: user.name.clone(),
        email: user.email.clone(),
    })
    .await;
    let orders = OrderRepository::default();
    let order_service = OrderService::new(orders.clone(), refs, producer.clone());
    let order = tokio_test::assert_ok!(
        order_service
            .create_order(NewOrder {
                user_id: user.id,
                product: "Laptop".into(),
                quantity: 1,
                price: 999.99,
            })
            .await
    );

    assert_eq!(orders.get(order.id).await.unwrap().product, "Laptop");
    assert_eq!(producer.metrics().snapshot().publish_failures, 2);
    assert_eq!(broker.message_count("order.created").await, 0);
}

// ─── Lifecycle & shutdown ────────────────────────────────────────

struct Blocking {
    started: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl EventHandler<OrderCreated> for Blocking {
    async fn handle(&self, _event: OrderCreated, ctx: &MessageContext) -> Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        ctx.cancellation.cancelled().await;
        Err("interrupted".into())
    }
}

#[tokio::test]
async fn test_cancellation_during_handler_is_clean_exit_without_commit() {
    let broker = single_partition();
    producer(&broker).publish_event(&order("Laptop")).await.unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let factory = {
        let started = started.clone();
        FnFactory::new(move || Blocking {
            started: started.clone(),
        })
    };
    let consumer = order_consumer(&broker, factory, fast_options());
    let mut state = consumer.state();
    assert_eq!(*state.borrow(), ConsumerState::Created);

    let (token, handle) = start(consumer);
    wait_until(|| started.load(Ordering::SeqCst)).await;
    assert_eq!(*state.borrow_and_update(), ConsumerState::Running);

    let report = stop(token, handle).await;
    assert_eq!(report.metrics.handler_failures, 0);
    assert_eq!(report.metrics.committed, 0);
    assert!(broker.commits(GROUP).await.is_empty());
    assert_eq!(*state.borrow(), ConsumerState::Disposed);
}

#[tokio::test]
async fn test_connect_fails_fast_without_group() {
    let broker = MemoryBroker::default();
    let recorder = Recorder::new(&broker);
    let settings = MessagingSettings::default();
    let result =
        EventConsumer::<OrderCreated, _>::connect(&broker, &settings, recorder.factory()).await;
    let err = tokio_test::assert_err!(result);
    assert!(err.is_config_error());
}

#[tokio::test]
async fn test_services_wired_through_consumer_host() {
    let broker = MemoryBroker::default();
    let mut base = MessagingSettings::default();
    base.consumer.poll_timeout_ms = 20;

    let producer = Arc::new(EventProducer::connect(&broker, &base).await.unwrap());

    // Users side: owns users, consumes OrderCreated
    let users = UserRepository::default();
    let user_service = UserService::new(users.clone(), producer.clone());
    let mut users_settings = base.clone();
    users_settings.consumer.group_id = "user-service".into();
    let order_created = {
        let users = users.clone();
        EventConsumer::<OrderCreated, _>::connect(
            &broker,
            &users_settings,
            FnFactory::new(move || OrderCreatedHandler::new(users.clone())),
        )
        .await
        .unwrap()
    };

    // Orders side: caches users, consumes UserCreated
    let refs = UserRefStore::default();
    let order_service =
        OrderService::new(OrderRepository::default(), refs.clone(), producer.clone());
    let mut orders_settings = base.clone();
    orders_settings.consumer.group_id = "order-service".into();
    let user_created = {
        let refs = refs.clone();
        EventConsumer::<UserCreated, _>::connect(
            &broker,
            &orders_settings,
            FnFactory::new(move || UserCreatedHandler::new(refs.clone())),
        )
        .await
        .unwrap()
    };

    let mut host = ConsumerHost::new();
    host.spawn(order_created);
    host.spawn(user_created);
    assert_eq!(host.len(), 2);

    let user = user_service
        .create_user(NewUser {
            name: "Ada".into(),
            email: "ada@example.com".into(),
        })
        .await
        .unwrap();

    for _ in 0..500 {
        if refs.contains(user.id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refs.contains(user.id).await, "UserCreated never reached the orders side");

    let order = order_service
        .create_order(NewOrder {
            user_id: user.id,
            product: "Laptop".into(),
            quantity: 1,
            price: 999.99,
        })
        .await
        .unwrap();

    for _ in 0..500 {
        if !users.orders_for(user.id).await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let history = users.orders_for(user.id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].order_id, order.id);

    let report = host.shutdown(Duration::from_secs(5)).await;
    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 2);
    producer.shutdown().await.unwrap();
}
