//! Lock-free counters for producers and consumers
//!
//! Counters are monotonic for the life of the component; `snapshot()`
//! copies them into a plain serializable struct.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Consumer loop counters
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    received: AtomicU64,
    handled: AtomicU64,
    committed: AtomicU64,
    handler_failures: AtomicU64,
    deserialization_failures: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates_skipped: AtomicU64,
    poll_errors: AtomicU64,
    commit_errors: AtomicU64,
    redeliver_errors: AtomicU64,
}

/// Point-in-time copy of `ConsumerMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerMetricsSnapshot {
    pub received: u64,
    pub handled: u64,
    pub committed: u64,
    pub handler_failures: u64,
    pub deserialization_failures: u64,
    pub dead_lettered: u64,
    pub duplicates_skipped: u64,
    pub poll_errors: u64,
    pub commit_errors: u64,
    pub redeliver_errors: u64,
}

impl ConsumerMetrics {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deserialization_failure(&self) {
        self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_error(&self) {
        self.commit_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redeliver_error(&self) {
        self.redeliver_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            deserialization_failures: self.deserialization_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            redeliver_errors: self.redeliver_errors.load(Ordering::Relaxed),
        }
    }
}

/// Producer counters
#[derive(Debug, Default)]
pub struct ProducerMetrics {
    published: AtomicU64,
    publish_failures: AtomicU64,
    bytes_published: AtomicU64,
}

/// Point-in-time copy of `ProducerMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerMetricsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub bytes_published: u64,
}

impl ProducerMetrics {
    pub(crate) fn record_published(&self, bytes: usize) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> ProducerMetricsSnapshot {
        ProducerMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
        }
    }
}
