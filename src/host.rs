//! Hosting for consumer loops
//!
//! `ConsumerHost` owns the process-wide shutdown token, spawns one task
//! per consumer and joins them all on shutdown. A consumer that fails or
//! panics is reported, never propagated into the host.

use crate::consumer::{ConsumerReport, EventConsumer};
use crate::handler::HandlerFactory;
use crate::types::Event;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Outcome of `ConsumerHost::shutdown`
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Loops that exited cleanly
    pub stopped: Vec<ConsumerReport>,

    /// Loops that ended with an error or panicked (topic, error)
    pub failed: Vec<(String, String)>,

    /// Loops still running at the deadline, aborted
    pub aborted: usize,
}

impl ShutdownReport {
    /// True when every loop exited cleanly
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.aborted == 0
    }
}

/// Runs consumer loops as background tasks
pub struct ConsumerHost {
    cancellation: CancellationToken,
    tasks: JoinSet<(String, crate::error::Result<ConsumerReport>)>,
}

impl Default for ConsumerHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerHost {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Host driven by an existing shutdown token
    pub fn with_token(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            tasks: JoinSet::new(),
        }
    }

    /// The shutdown token handed to every loop
    pub fn token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Number of loops spawned and not yet joined
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a consumer loop on the current runtime
    pub fn spawn<E, F>(&mut self, consumer: EventConsumer<E, F>)
    where
        E: Event,
        F: HandlerFactory<E>,
    {
        let topic = consumer.topic().to_string();
        let token = self.cancellation.child_token();

        tracing::debug!(topic = %topic, event_type = E::EVENT_TYPE, "Spawning consumer");
        self.tasks
            .spawn(async move { (topic, consumer.run(token).await) });
    }

    /// Cancel every loop and wait up to `timeout` for them to exit
    pub async fn shutdown(mut self, timeout: Duration) -> ShutdownReport {
        self.cancellation.cancel();
        let mut report = ShutdownReport::default();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let joined = match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    report.aborted = self.tasks.len();
                    tracing::warn!(
                        remaining = report.aborted,
                        "Consumers did not stop in time; aborting"
                    );
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            };

            match joined {
                Ok((_, Ok(stopped))) => report.stopped.push(stopped),
                Ok((topic, Err(e))) => {
                    tracing::error!(topic = %topic, error = %e, "Consumer exited with error");
                    report.failed.push((topic, e.to_string()));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Consumer task panicked");
                    report.failed.push((String::from("<unknown>"), e.to_string()));
                }
            }
        }

        tracing::info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            aborted = report.aborted,
            "Consumer host shut down"
        );
        report
    }
}
