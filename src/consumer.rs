//! At-least-once consumer loop
//!
//! One `EventConsumer` is bound to exactly one (topic, event type) pair and
//! owns its broker consumer connection. The loop:
//!
//! 1. polls with a bounded timeout, racing the shutdown token;
//! 2. decodes the payload into the bound event type;
//! 3. resolves a fresh handler from the factory and invokes it;
//! 4. commits the offset synchronously, and only after the handler succeeded.
//!
//! A handler failure leaves the message uncommitted and seeks back so the
//! next poll presents it again. A payload that cannot be decoded is logged
//! and held back the same way, without invoking any handler. Neither case
//! stops the loop; only cancellation does.
//!
//! ```text
//! Created ──run()──▶ Running ──cancel──▶ Stopping ──close──▶ Disposed
//! ```

use crate::broker::{BrokerConnector, BrokerConsumer};
use crate::config::{ConsumerSettings, MessagingSettings};
use crate::dead_letter::{DeadLetter, DeadLetterPolicy};
use crate::error::{HandlerError, MessagingError, Result};
use crate::handler::{EventHandler, HandlerFactory, MessageContext};
use crate::idempotency::IdempotencyStore;
use crate::metrics::{ConsumerMetrics, ConsumerMetricsSnapshot};
use crate::types::{Delivery, Event};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, not yet subscribed
    Created,
    /// Subscribed and polling
    Running,
    /// Shutdown requested; releasing the subscription
    Stopping,
    /// Connection closed; terminal
    Disposed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerState::Created => "created",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Delay between redeliveries of a message whose handler failed
///
/// The schedule is indexed by failure count; the last entry repeats. An
/// empty schedule retries immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    /// Redeliver on the very next poll
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Use an explicit delay schedule
    pub fn with_backoff(backoff: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            backoff: backoff.into_iter().collect(),
        }
    }

    /// Doubling delays from `initial`, capped at `max`
    pub fn exponential(initial: Duration, max: Duration, steps: usize) -> Self {
        let mut delay = initial;
        let mut backoff = Vec::with_capacity(steps);
        for _ in 0..steps {
            backoff.push(delay.min(max));
            delay = delay.saturating_mul(2);
        }
        Self { backoff }
    }

    /// Delay after the `failures`-th failed attempt (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.backoff.is_empty() || failures == 0 {
            return Duration::ZERO;
        }
        let idx = (failures as usize - 1).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

/// Consumer loop tuning and optional extensions
#[derive(Clone)]
pub struct ConsumerOptions {
    /// Upper bound on a single poll
    pub poll_timeout: Duration,

    /// Delay before a failed message is presented again
    pub retry: RetryPolicy,

    /// Delay after a failed poll before polling again
    pub poll_error_backoff: Duration,

    /// Escape path for poison messages; `None` never commits them
    pub dead_letter: Option<DeadLetterPolicy>,

    /// Duplicate suppression keyed by `Event::idempotency_key`
    pub idempotency: Option<Arc<dyn IdempotencyStore>>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            retry: RetryPolicy::immediate(),
            poll_error_backoff: Duration::from_millis(500),
            dead_letter: None,
            idempotency: None,
        }
    }
}

impl ConsumerOptions {
    /// Options taking the poll timeout from settings
    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self {
            poll_timeout: settings.poll_timeout(),
            ..Default::default()
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_error_backoff(mut self, backoff: Duration) -> Self {
        self.poll_error_backoff = backoff;
        self
    }

    pub fn with_dead_letter(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter = Some(policy);
        self
    }

    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }
}

/// Summary returned when a consumer loop exits
#[derive(Debug, Clone)]
pub struct ConsumerReport {
    pub topic: String,
    pub group_id: String,
    pub event_type: &'static str,
    pub metrics: ConsumerMetricsSnapshot,
}

enum Flow {
    Continue,
    Stop,
}

/// Background consumer bound to one topic and one event type
pub struct EventConsumer<E, F> {
    consumer: Box<dyn BrokerConsumer>,
    topic: String,
    group_id: String,
    factory: F,
    options: ConsumerOptions,
    metrics: Arc<ConsumerMetrics>,
    state: watch::Sender<ConsumerState>,
    /// (partition, offset) → failed handler attempts for that message
    attempts: HashMap<(i32, i64), u32>,
    _event: PhantomData<fn() -> E>,
}

impl<E, F> fmt::Debug for EventConsumer<E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConsumer")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

impl<E, F> EventConsumer<E, F>
where
    E: Event,
    F: HandlerFactory<E>,
{
    /// Bind an already-open broker consumer to `topic`
    pub fn new(
        consumer: impl BrokerConsumer + 'static,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        factory: F,
    ) -> Self {
        Self::from_boxed(Box::new(consumer), topic.into(), group_id.into(), factory)
    }

    /// Open a dedicated consumer connection and bind it to the topic
    /// configured for `E`
    ///
    /// Fails fast on invalid settings, an unbound event type, or an
    /// unreachable broker.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        settings: &MessagingSettings,
        factory: F,
    ) -> Result<Self> {
        settings.validate_consumer()?;
        let topic = settings.topics.topic_for(E::EVENT_TYPE)?.to_string();
        let consumer = connector.connect_consumer(settings).await?;

        tracing::info!(
            backend = consumer.name(),
            topic = %topic,
            group_id = %settings.consumer.group_id,
            event_type = E::EVENT_TYPE,
            auto_offset_reset = %settings.consumer.auto_offset_reset,
            "Event consumer connected"
        );

        Ok(
            Self::from_boxed(consumer, topic, settings.consumer.group_id.clone(), factory)
                .with_options(ConsumerOptions::from_settings(&settings.consumer)),
        )
    }

    fn from_boxed(
        consumer: Box<dyn BrokerConsumer>,
        topic: String,
        group_id: String,
        factory: F,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Created);
        Self {
            consumer,
            topic,
            group_id,
            factory,
            options: ConsumerOptions::default(),
            metrics: Arc::new(ConsumerMetrics::default()),
            state,
            attempts: HashMap::new(),
            _event: PhantomData,
        }
    }

    /// Replace the loop options
    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Bound topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group id
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Shared handle to the loop counters, valid after `run` consumes self
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Watch the lifecycle state
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run until `cancellation` fires, then release the subscription
    ///
    /// Errors inside an iteration are logged and never end the loop. Only a
    /// failed subscription is returned as an error.
    pub async fn run(mut self, cancellation: CancellationToken) -> Result<ConsumerReport> {
        if let Err(e) = self.consumer.subscribe(&self.topic).await {
            tracing::error!(
                topic = %self.topic,
                group_id = %self.group_id,
                error = %e,
                "Failed to subscribe"
            );
            self.dispose().await;
            return Err(e);
        }

        self.state.send_replace(ConsumerState::Running);
        tracing::info!(
            topic = %self.topic,
            group_id = %self.group_id,
            event_type = E::EVENT_TYPE,
            "Consumer started"
        );

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                polled = self.consumer.poll(self.options.poll_timeout) => polled,
            };

            let delivery = match polled {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    self.metrics.record_poll_error();
                    tracing::warn!(
                        topic = %self.topic,
                        group_id = %self.group_id,
                        error = %e,
                        "Poll failed; retrying"
                    );
                    if sleep_or_cancelled(self.options.poll_error_backoff, &cancellation).await {
                        break;
                    }
                    continue;
                }
            };

            if let Flow::Stop = self.process(delivery, &cancellation).await {
                break;
            }
        }

        self.dispose().await;

        let report = ConsumerReport {
            topic: self.topic.clone(),
            group_id: self.group_id.clone(),
            event_type: E::EVENT_TYPE,
            metrics: self.metrics.snapshot(),
        };
        tracing::info!(
            topic = %report.topic,
            group_id = %report.group_id,
            handled = report.metrics.handled,
            committed = report.metrics.committed,
            "Consumer stopped"
        );
        Ok(report)
    }

    async fn process(&mut self, delivery: Delivery, cancellation: &CancellationToken) -> Flow {
        self.metrics.record_received();
        tracing::debug!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            event_type = E::EVENT_TYPE,
            "Message received"
        );

        let slot = (delivery.partition, delivery.offset);
        let failures = self.attempts.get(&slot).copied().unwrap_or(0);
        let attempt = failures + 1;

        let event: E = match serde_json::from_slice(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                let raw = delivery.payload_lossy();
                let err = MessagingError::Deserialization {
                    event_type: E::EVENT_TYPE.to_string(),
                    reason: e.to_string(),
                    raw: raw.clone(),
                };
                self.metrics.record_deserialization_failure();
                tracing::error!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_type = E::EVENT_TYPE,
                    attempt,
                    error = %err,
                    payload = %raw,
                    "Failed to deserialize message; leaving it uncommitted"
                );
                if self.options.dead_letter.is_some()
                    && self.dead_letter(&delivery, err.to_string(), attempt).await
                {
                    self.attempts.remove(&slot);
                    return Flow::Continue;
                }
                return self.hold_back(&delivery, attempt, cancellation).await;
            }
        };

        let ctx = MessageContext::from_delivery(&delivery, attempt, cancellation.clone());

        let idempotency = self.options.idempotency.clone();
        let idempotency_key = event.idempotency_key();
        let group_id = self.group_id.as_str();
        if already_processed(idempotency.as_deref(), group_id, idempotency_key.as_deref(), &delivery)
            .await
        {
            self.metrics.record_duplicate();
            self.attempts.remove(&slot);
            self.commit(&delivery).await;
            return Flow::Continue;
        }

        match invoke(&self.factory, event, &ctx).await {
            Ok(()) => {
                self.metrics.record_handled();
                self.attempts.remove(&slot);
                let group_id = self.group_id.as_str();
                mark_processed(idempotency.as_deref(), group_id, idempotency_key.as_deref()).await;
                self.commit(&delivery).await;
                Flow::Continue
            }
            Err(e) if cancellation.is_cancelled() => {
                tracing::info!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_type = E::EVENT_TYPE,
                    error = %e,
                    "Handler interrupted by shutdown; message left uncommitted"
                );
                Flow::Stop
            }
            Err(e) => {
                let err = MessagingError::Handler {
                    event_type: E::EVENT_TYPE.to_string(),
                    reason: e.to_string(),
                };
                self.metrics.record_handler_failure();
                tracing::error!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_type = E::EVENT_TYPE,
                    attempt,
                    error = %err,
                    payload = %delivery.payload_lossy(),
                    "Handler failed; message left uncommitted"
                );

                let exhausted = self
                    .options
                    .dead_letter
                    .as_ref()
                    .is_some_and(|policy| policy.exhausted(attempt));
                if exhausted && self.dead_letter(&delivery, err.to_string(), attempt).await {
                    self.attempts.remove(&slot);
                    return Flow::Continue;
                }

                self.hold_back(&delivery, attempt, cancellation).await
            }
        }
    }

    /// Seek back to a failed message so the partition never moves past it,
    /// then wait out the retry delay
    ///
    /// The seek is retried with the poll error backoff until it succeeds;
    /// polling on before that could commit a later offset of the partition.
    async fn hold_back(
        &mut self,
        delivery: &Delivery,
        attempt: u32,
        cancellation: &CancellationToken,
    ) -> Flow {
        self.attempts.insert((delivery.partition, delivery.offset), attempt);

        while let Err(e) = self.consumer.redeliver(delivery).await {
            self.metrics.record_redeliver_error();
            tracing::warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "Failed to request redelivery; retrying"
            );
            if sleep_or_cancelled(self.options.poll_error_backoff, cancellation).await {
                return Flow::Stop;
            }
        }

        let delay = self.options.retry.delay_for(attempt);
        if !delay.is_zero() && sleep_or_cancelled(delay, cancellation).await {
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Commit synchronously; a failed commit is logged and the message may
    /// be delivered again after a restart
    async fn commit(&mut self, delivery: &Delivery) {
        match self.consumer.commit(delivery).await {
            Ok(()) => {
                self.metrics.record_committed();
                tracing::debug!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Offset committed"
                );
            }
            Err(e) => {
                self.metrics.record_commit_error();
                tracing::error!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "Failed to commit offset"
                );
            }
        }
    }

    /// Hand a message to the dead-letter sink and commit it.
    /// Returns false (message untouched) if the sink rejects it.
    async fn dead_letter(&mut self, delivery: &Delivery, reason: String, attempts: u32) -> bool {
        let Some(policy) = self.options.dead_letter.clone() else {
            return false;
        };
        let letter = DeadLetter::new(delivery.clone(), E::EVENT_TYPE, reason, attempts);
        match policy.sink.send(letter).await {
            Ok(()) => {
                self.metrics.record_dead_lettered();
                self.commit(delivery).await;
                true
            }
            Err(e) => {
                tracing::error!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "Failed to dead-letter message"
                );
                false
            }
        }
    }

    async fn dispose(&mut self) {
        self.state.send_replace(ConsumerState::Stopping);
        if let Err(e) = self.consumer.close().await {
            tracing::warn!(topic = %self.topic, error = %e, "Failed to close consumer");
        }
        self.attempts.clear();
        self.state.send_replace(ConsumerState::Disposed);
    }
}

/// Resolve a handler scoped to this message and run it; the handler is
/// dropped before returning on every path
async fn invoke<E, F>(
    factory: &F,
    event: E,
    ctx: &MessageContext,
) -> std::result::Result<(), HandlerError>
where
    E: Event,
    F: HandlerFactory<E>,
{
    let handler = factory.resolve(ctx)?;
    handler.handle(event, ctx).await
}

async fn already_processed(
    store: Option<&dyn IdempotencyStore>,
    group_id: &str,
    key: Option<&str>,
    delivery: &Delivery,
) -> bool {
    let (Some(store), Some(key)) = (store, key) else {
        return false;
    };
    match store.is_processed(group_id, key).await {
        Ok(true) => {
            tracing::info!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                idempotency_key = %key,
                "Skipping already processed event"
            );
            true
        }
        Ok(false) => false,
        Err(e) => {
            tracing::warn!(
                idempotency_key = %key,
                error = %e,
                "Idempotency check failed; handling anyway"
            );
            false
        }
    }
}

async fn mark_processed(store: Option<&dyn IdempotencyStore>, group_id: &str, key: Option<&str>) {
    let (Some(store), Some(key)) = (store, key) else {
        return;
    };
    if let Err(e) = store.mark_processed(group_id, key).await {
        tracing::warn!(
            idempotency_key = %key,
            error = %e,
            "Failed to record processed event"
        );
    }
}

/// Sleep for `delay`; returns true if cancelled first
async fn sleep_or_cancelled(delay: Duration, cancellation: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancellation.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
