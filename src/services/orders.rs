//! Orders service: creates orders and keeps a local cache of known users

use crate::error::HandlerError;
use crate::events::{OrderCreated, UserCreated};
use crate::handler::{EventHandler, MessageContext};
use crate::producer::EventProducer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A stored order
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product: String,
    pub quantity: i32,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

/// Order creation request
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub product: String,
    pub quantity: i32,
    pub price: f64,
}

/// Reference to a user known to the orders service, filled from
/// `UserCreated` events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("User does not exist: {0}")]
    UnknownUser(Uuid),

    #[error("Invalid order: {0}")]
    Invalid(String),
}

/// In-memory order storage
#[derive(Clone, Default)]
pub struct OrderRepository {
    orders: Arc<RwLock<HashMap<Uuid, Order>>>,
}

impl OrderRepository {
    pub async fn insert(&self, order: Order) {
        self.orders.write().await.insert(order.id, order);
    }

    pub async fn get(&self, id: Uuid) -> Option<Order> {
        self.orders.read().await.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.orders.read().await.len()
    }
}

/// Local cache of users, populated by `UserCreatedHandler`
#[derive(Clone, Default)]
pub struct UserRefStore {
    users: Arc<RwLock<HashMap<Uuid, UserRef>>>,
}

impl UserRefStore {
    /// Insert or replace; returns true if the user was new
    pub async fn upsert(&self, user: UserRef) -> bool {
        self.users.write().await.insert(user.user_id, user).is_none()
    }

    pub async fn get(&self, user_id: Uuid) -> Option<UserRef> {
        self.users.read().await.get(&user_id).cloned()
    }

    pub async fn contains(&self, user_id: Uuid) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }
}

/// Authoritative user lookup consulted when the local cache misses
/// (e.g. the users service API)
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: Uuid) -> Result<bool, HandlerError>;
}

pub struct OrderService {
    orders: OrderRepository,
    users: UserRefStore,
    directory: Option<Arc<dyn UserDirectory>>,
    producer: Arc<EventProducer>,
}

impl OrderService {
    pub fn new(orders: OrderRepository, users: UserRefStore, producer: Arc<EventProducer>) -> Self {
        Self {
            orders,
            users,
            directory: None,
            producer,
        }
    }

    /// Fall back to `directory` for users missing from the local cache
    pub fn with_user_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Store an order and announce it
    ///
    /// The order is stored even if publishing `OrderCreated` fails; the
    /// failure is only logged.
    pub async fn create_order(&self, request: NewOrder) -> Result<Order, OrderError> {
        validate(&request)?;
        tracing::info!(
            user_id = %request.user_id,
            product = %request.product,
            quantity = request.quantity,
            price = request.price,
            "Creating order"
        );

        if !self.user_exists(request.user_id).await {
            tracing::error!(user_id = %request.user_id, "Order rejected: unknown user");
            return Err(OrderError::UnknownUser(request.user_id));
        }

        let order = Order {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            product: request.product,
            quantity: request.quantity,
            price: request.price,
            created_at: Utc::now(),
        };
        self.orders.insert(order.clone()).await;
        tracing::info!(order_id = %order.id, "Order created");

        let event = OrderCreated {
            order_id: order.id,
            user_id: order.user_id,
            product: order.product.clone(),
            quantity: order.quantity,
            price: order.price,
        };
        if let Err(e) = self.producer.publish_event(&event).await {
            tracing::error!(
                order_id = %order.id,
                error = %e,
                "Failed to publish OrderCreated; order kept"
            );
        }

        Ok(order)
    }

    pub async fn get_order(&self, id: Uuid) -> Option<Order> {
        self.orders.get(id).await
    }

    async fn user_exists(&self, user_id: Uuid) -> bool {
        if self.users.contains(user_id).await {
            tracing::debug!(user_id = %user_id, "User found in local cache");
            return true;
        }
        let Some(directory) = &self.directory else {
            return false;
        };
        match directory.user_exists(user_id).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "User lookup failed");
                false
            }
        }
    }
}

fn validate(request: &NewOrder) -> Result<(), OrderError> {
    if request.product.trim().is_empty() {
        return Err(OrderError::Invalid("product is required".to_string()));
    }
    if request.quantity < 1 {
        return Err(OrderError::Invalid("quantity must be at least 1".to_string()));
    }
    if !(0.0..=999_999_999.99).contains(&request.price) {
        return Err(OrderError::Invalid("price is out of range".to_string()));
    }
    Ok(())
}

/// Records users announced by the users service in the local cache
///
/// Upserts, so a redelivered event leaves the cache unchanged.
#[derive(Clone)]
pub struct UserCreatedHandler {
    users: UserRefStore,
}

impl UserCreatedHandler {
    pub fn new(users: UserRefStore) -> Self {
        Self { users }
    }
}

#[async_trait]
impl EventHandler<UserCreated> for UserCreatedHandler {
    async fn handle(&self, event: UserCreated, ctx: &MessageContext) -> Result<(), HandlerError> {
        let inserted = self
            .users
            .upsert(UserRef {
                user_id: event.user_id,
                name: event.name,
                email: event.email,
            })
            .await;

        tracing::info!(
            user_id = %event.user_id,
            offset = ctx.offset,
            inserted,
            "User reference stored"
        );
        Ok(())
    }
}
