//! Partition-key ordering property
//!
//! Events published with the same key land in one partition and reach the
//! consumer in publish order, whatever the interleaving with other keys.

use commerce_events::broker::memory::{MemoryBroker, MemoryConfig};
use commerce_events::{
    ConsumerOptions, Event, EventConsumer, EventHandler, EventProducer, HandlerError,
    HandlerFactory, MessageContext, MessagingSettings, OffsetReset, SharedFactory,
};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tick {
    key: String,
    seq: u32,
}

impl Event for Tick {
    const EVENT_TYPE: &'static str = "Tick";

    fn partition_key(&self) -> String {
        self.key.clone()
    }
}

#[derive(Default)]
struct Collect {
    /// (key, seq, partition) in consumption order
    seen: Mutex<Vec<(String, u32, i32)>>,
}

#[async_trait::async_trait]
impl EventHandler<Tick> for Collect {
    async fn handle(&self, event: Tick, ctx: &MessageContext) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap()
            .push((event.key, event.seq, ctx.partition));
        Ok(())
    }
}

async fn publish_and_consume(keys: Vec<usize>, partitions: i32) -> Vec<(String, u32, i32)> {
    let broker = MemoryBroker::new(MemoryConfig { partitions });
    let settings = MessagingSettings::default();
    let producer = EventProducer::new(broker.producer(), &settings);

    let mut next_seq: HashMap<String, u32> = HashMap::new();
    for k in &keys {
        let key = format!("order-{k}");
        let seq = next_seq.entry(key.clone()).or_insert(0);
        producer
            .publish("ticks", &key, &Tick { key: key.clone(), seq: *seq })
            .await
            .unwrap();
        *seq += 1;
    }

    let collect = SharedFactory::new(Collect::default());
    let consumer = EventConsumer::new(
        broker.consumer("ordering", OffsetReset::Earliest),
        "ticks",
        "ordering",
        collect.clone(),
    )
    .with_options(ConsumerOptions::default().with_poll_timeout(Duration::from_millis(10)));

    let token = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(token.clone()));
    for _ in 0..500 {
        if broker.commits("ordering").await.len() >= keys.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    token.cancel();
    handle.await.unwrap().unwrap();

    let handler = HandlerFactory::<Tick>::resolve(&collect, &context()).unwrap();
    let seen = handler.seen.lock().unwrap().clone();
    seen
}

fn context() -> MessageContext {
    MessageContext {
        topic: "ticks".into(),
        partition: 0,
        offset: 0,
        key: None,
        headers: Default::default(),
        attempt: 1,
        cancellation: CancellationToken::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_per_key_order_preserved(
        keys in prop::collection::vec(0usize..5, 1..40),
        partitions in 1i32..5,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let seen = rt.block_on(publish_and_consume(keys.clone(), partitions));

        prop_assert_eq!(seen.len(), keys.len());

        let mut last_seq: HashMap<&str, u32> = HashMap::new();
        let mut partition_of: HashMap<&str, i32> = HashMap::new();
        for (key, seq, partition) in &seen {
            if let Some(prev) = last_seq.insert(key.as_str(), *seq) {
                prop_assert!(*seq == prev + 1, "key {} went {} -> {}", key, prev, seq);
            } else {
                prop_assert_eq!(*seq, 0);
            }
            let first = *partition_of.entry(key.as_str()).or_insert(*partition);
            prop_assert_eq!(first, *partition);
        }
    }
}
