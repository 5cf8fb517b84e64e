//! Event handler contract and per-message handler resolution
//!
//! A handler is business code reacting to one event type. It never sees the
//! broker. Handlers are resolved from a `HandlerFactory` once per message, so
//! state acquired for one message (a database session, a transaction) is
//! released when the handler is dropped and never leaks into the next.

use crate::error::HandlerError;
use crate::types::{Delivery, Event, Headers};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-message context passed to a handler
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Source topic
    pub topic: String,

    /// Source partition
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Partition key, if present
    pub key: Option<String>,

    /// Metadata headers (informational; the payload is the contract)
    pub headers: Headers,

    /// Delivery attempt for this message within the running consumer (1-based)
    pub attempt: u32,

    /// Process-wide shutdown signal
    pub cancellation: CancellationToken,
}

impl MessageContext {
    pub(crate) fn from_delivery(
        delivery: &Delivery,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            key: delivery.key.clone(),
            headers: delivery.headers.clone(),
            attempt,
            cancellation,
        }
    }

    /// True once shutdown has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Business reaction to one event type
///
/// Delivery is at-least-once: the same event may be handled more than once
/// (e.g. after a crash between handling and commit), so implementations
/// must tolerate duplicates.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Handle an event. `Err` leaves the message uncommitted.
    async fn handle(&self, event: E, ctx: &MessageContext) -> Result<(), HandlerError>;
}

/// Resolves a fresh handler for each message
pub trait HandlerFactory<E: Event>: Send + Sync + 'static {
    type Handler: EventHandler<E>;

    /// Create the handler scoped to one message
    ///
    /// A resolution failure is treated like a handler failure.
    fn resolve(&self, ctx: &MessageContext) -> Result<Self::Handler, HandlerError>;
}

/// Factory from a closure: `move || MyHandler::new(pool.clone())`
pub struct FnFactory<F> {
    make: F,
}

impl<F> FnFactory<F> {
    pub fn new(make: F) -> Self {
        Self { make }
    }
}

impl<E, H, F> HandlerFactory<E> for FnFactory<F>
where
    E: Event,
    H: EventHandler<E>,
    F: Fn() -> H + Send + Sync + 'static,
{
    type Handler = H;

    fn resolve(&self, _ctx: &MessageContext) -> Result<H, HandlerError> {
        Ok((self.make)())
    }
}

/// Factory that hands out one shared, stateless handler
///
/// Only for handlers with no per-message state.
pub struct SharedFactory<H> {
    handler: Arc<H>,
}

impl<H> SharedFactory<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for SharedFactory<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

#[async_trait]
impl<E, H> EventHandler<E> for Arc<H>
where
    E: Event,
    H: EventHandler<E> + ?Sized,
{
    async fn handle(&self, event: E, ctx: &MessageContext) -> Result<(), HandlerError> {
        (**self).handle(event, ctx).await
    }
}

impl<E, H> HandlerFactory<E> for SharedFactory<H>
where
    E: Event,
    H: EventHandler<E> + 'static,
{
    type Handler = Arc<H>;

    fn resolve(&self, _ctx: &MessageContext) -> Result<Arc<H>, HandlerError> {
        Ok(self.handler.clone())
    }
}
