//! In-memory broker for tests and single-process wiring
//!
//! Models the parts of a partitioned log that the consumer contract depends
//! on: keyed partitioning, per-group committed offsets, offset reset
//! policies, and seek-back redelivery. Every produce, delivery, commit and
//! redelivery is appended to a journal so tests can assert on ordering.
//!
//! Simplification: each consumer is assigned every partition of the topics
//! it subscribes to; there is no group rebalancing between members.

use super::{BrokerConnector, BrokerConsumer, BrokerProducer};
use crate::config::MessagingSettings;
use crate::error::{MessagingError, Result};
use crate::types::{Ack, Delivery, Headers, OffsetReset, OutboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// In-memory broker configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Partitions created for each new topic
    pub partitions: i32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { partitions: 3 }
    }
}

/// A journal entry describing one broker interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Produced {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Delivered {
        group: String,
        topic: String,
        partition: i32,
        offset: i64,
    },
    Committed {
        group: String,
        topic: String,
        partition: i32,
        offset: i64,
    },
    Redelivered {
        group: String,
        topic: String,
        partition: i32,
        offset: i64,
    },
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Bytes,
    headers: Headers,
}

type GroupPartition = (String, String, i32);

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) → next offset to consume
    committed: HashMap<GroupPartition, i64>,
    journal: Vec<JournalEntry>,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str, count: i32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count.max(1) as usize])
    }
}

struct Shared {
    config: MemoryConfig,
    state: Mutex<BrokerState>,
    appended: Notify,
    unavailable: AtomicBool,
    poll_failures: AtomicUsize,
    commit_failures: AtomicUsize,
    redeliver_failures: AtomicUsize,
}

/// In-process broker shared by any number of producers and consumers
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(BrokerState::default()),
                appended: Notify::new(),
                unavailable: AtomicBool::new(false),
                poll_failures: AtomicUsize::new(0),
                commit_failures: AtomicUsize::new(0),
                redeliver_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a producer connection
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a consumer connection for a group
    pub fn consumer(&self, group_id: impl Into<String>, reset: OffsetReset) -> MemoryConsumer {
        MemoryConsumer {
            shared: self.shared.clone(),
            group: group_id.into(),
            reset,
            positions: Vec::new(),
            cursor: 0,
            closed: false,
        }
    }

    /// Make every produce fail until reset (simulates a broker outage)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` polls across all consumers
    pub fn fail_next_polls(&self, n: usize) {
        self.shared.poll_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commits across all consumers
    pub fn fail_next_commits(&self, n: usize) {
        self.shared.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` redelivery requests across all consumers; the
    /// failed request leaves the read position where it was
    pub fn fail_next_redelivers(&self, n: usize) {
        self.shared.redeliver_failures.store(n, Ordering::SeqCst);
    }

    /// Number of partitions for a topic (0 if it does not exist)
    pub async fn partition_count(&self, topic: &str) -> i32 {
        let state = self.shared.state.lock().await;
        state.topics.get(topic).map(|p| p.len() as i32).unwrap_or(0)
    }

    /// Number of records stored in a topic across partitions
    pub async fn message_count(&self, topic: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|parts| parts.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Committed offset (next offset to consume) for a group partition
    pub async fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Copy of the full interaction journal
    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.shared.state.lock().await.journal.clone()
    }

    /// Commits recorded for a group, in order
    pub async fn commits(&self, group: &str) -> Vec<(String, i32, i64)> {
        let state = self.shared.state.lock().await;
        state
            .journal
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Committed {
                    group: g,
                    topic,
                    partition,
                    offset,
                } if g == group => Some((topic.clone(), *partition, *offset)),
                _ => None,
            })
            .collect()
    }

    /// Payloads stored in a topic partition, in offset order
    pub async fn records(&self, topic: &str, partition: i32) -> Vec<(String, Bytes)> {
        let state = self.shared.state.lock().await;
        state
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map(|records| {
                records
                    .iter()
                    .map(|r| (r.key.clone(), r.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Produce a raw payload, bypassing any producer (e.g. to inject
    /// malformed messages)
    pub async fn inject(&self, topic: &str, key: &str, payload: impl Into<Bytes>) -> Ack {
        append(
            &self.shared,
            OutboundMessage::new(topic, key, payload.into()),
        )
        .await
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect_producer(&self, _settings: &MessagingSettings) -> Result<Box<dyn BrokerProducer>> {
        Ok(Box::new(self.producer()))
    }

    async fn connect_consumer(&self, settings: &MessagingSettings) -> Result<Box<dyn BrokerConsumer>> {
        settings.validate_consumer()?;
        Ok(Box::new(self.consumer(
            settings.consumer.group_id.clone(),
            settings.consumer.auto_offset_reset,
        )))
    }
}

/// Kafka-compatible murmur2 hash (same seed and mixing as the Java client)
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h: u32 = SEED ^ (length as u32);

    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    if tail.len() == 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Partition for a key, matching the default Kafka partitioner
pub fn partition_for_key(key: &str, partitions: i32) -> i32 {
    let partitions = partitions.max(1);
    (murmur2(key.as_bytes()) & 0x7fff_ffff) % partitions
}

async fn append(shared: &Shared, message: OutboundMessage) -> Ack {
    let ack = {
        let mut state = shared.state.lock().await;
        let parts = state.partitions_mut(&message.topic, shared.config.partitions);
        let partition = partition_for_key(&message.key, parts.len() as i32);
        let records = &mut parts[partition as usize];
        let offset = records.len() as i64;
        records.push(StoredRecord {
            key: message.key,
            payload: message.payload,
            headers: message.headers,
        });
        state.journal.push(JournalEntry::Produced {
            topic: message.topic.clone(),
            partition,
            offset,
        });
        Ack {
            topic: message.topic,
            partition,
            offset,
        }
    };
    shared.appended.notify_waiters();
    ack
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Producer connection to a `MemoryBroker`
pub struct MemoryProducer {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, message: OutboundMessage) -> Result<Ack> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed("memory producer".to_string()));
        }
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(MessagingError::Publish {
                topic: message.topic,
                reason: "broker unavailable".to_string(),
            });
        }
        Ok(append(&self.shared, message).await)
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        // Sends complete synchronously; nothing is ever in flight
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug, Clone)]
struct Position {
    topic: String,
    partition: i32,
    next: i64,
}

/// Consumer connection to a `MemoryBroker`
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    group: String,
    reset: OffsetReset,
    positions: Vec<Position>,
    cursor: usize,
    closed: bool,
}

impl MemoryConsumer {
    /// Consumer group of this connection
    pub fn group(&self) -> &str {
        &self.group
    }

    async fn next_available(&mut self) -> Option<Delivery> {
        let mut state = self.shared.state.lock().await;
        let count = self.positions.len();

        for step in 0..count {
            let idx = (self.cursor + step) % count;
            let pos = &mut self.positions[idx];
            let record = state
                .topics
                .get(&pos.topic)
                .and_then(|parts| parts.get(pos.partition as usize))
                .and_then(|records| records.get(pos.next as usize))
                .cloned();

            if let Some(record) = record {
                let delivery = Delivery {
                    topic: pos.topic.clone(),
                    partition: pos.partition,
                    offset: pos.next,
                    key: Some(record.key),
                    payload: record.payload,
                    headers: record.headers,
                };
                pos.next += 1;
                self.cursor = (idx + 1) % count;
                state.journal.push(JournalEntry::Delivered {
                    group: self.group.clone(),
                    topic: delivery.topic.clone(),
                    partition: delivery.partition,
                    offset: delivery.offset,
                });
                return Some(delivery);
            }
        }
        None
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(MessagingError::Closed(format!("memory consumer '{}'", self.group)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        if topic.is_empty() {
            return Err(MessagingError::Subscribe {
                topic: String::new(),
                reason: "topic name is empty".to_string(),
            });
        }

        let mut state = self.shared.state.lock().await;
        let lengths: Vec<i64> = state
            .partitions_mut(topic, self.shared.config.partitions)
            .iter()
            .map(|records| records.len() as i64)
            .collect();

        self.positions.retain(|p| p.topic != topic);
        for (partition, len) in lengths.into_iter().enumerate() {
            let partition = partition as i32;
            let committed = state
                .committed
                .get(&(self.group.clone(), topic.to_string(), partition))
                .copied();
            let next = match (committed, self.reset) {
                (Some(offset), _) => offset,
                (None, OffsetReset::Earliest) => 0,
                (None, OffsetReset::Latest) => len,
            };
            self.positions.push(Position {
                topic: topic.to_string(),
                partition,
                next,
            });
        }
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        if take_failure(&self.shared.poll_failures) {
            return Err(MessagingError::Poll {
                topic: self
                    .positions
                    .first()
                    .map(|p| p.topic.clone())
                    .unwrap_or_default(),
                reason: "injected poll failure".to_string(),
            });
        }

        let deadline = Instant::now() + timeout;
        let shared = self.shared.clone();
        loop {
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.next_available().await {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        if take_failure(&self.shared.commit_failures) {
            return Err(MessagingError::Commit {
                topic: delivery.topic.clone(),
                partition: delivery.partition,
                offset: delivery.offset,
                reason: "injected commit failure".to_string(),
            });
        }

        let mut state = self.shared.state.lock().await;
        state.committed.insert(
            (self.group.clone(), delivery.topic.clone(), delivery.partition),
            delivery.offset + 1,
        );
        state.journal.push(JournalEntry::Committed {
            group: self.group.clone(),
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
        });
        Ok(())
    }

    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        if take_failure(&self.shared.redeliver_failures) {
            return Err(MessagingError::Poll {
                topic: delivery.topic.clone(),
                reason: format!("injected seek failure at offset {}", delivery.offset),
            });
        }
        if let Some(pos) = self
            .positions
            .iter_mut()
            .find(|p| p.topic == delivery.topic && p.partition == delivery.partition)
        {
            pos.next = delivery.offset;
        }

        let mut state = self.shared.state.lock().await;
        state.journal.push(JournalEntry::Redelivered {
            group: self.group.clone(),
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.positions.clear();
        self.closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
