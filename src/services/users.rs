//! Users service: registers users and tracks the orders they placed

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

/// A registered user
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// User registration request
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
}

/// An order placed by a user, as seen by the users service
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub product: String,
    pub quantity: i32,
    pub price: f64,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("Email already registered: {0}")]
    DuplicateEmail(String),

    #[error("Invalid user: {0}")]
    Invalid(String),
}

#[derive(Default)]
struct UserTables {
    users: HashMap<Uuid, User>,
    /// lowercase email → user id
    emails: HashMap<String, Uuid>,
    orders: HashMap<Uuid, Vec<OrderSummary>>,
}

/// In-memory user storage with a unique email index
#[derive(Clone, Default)]
pub struct UserRepository {
    tables: Arc<RwLock<UserTables>>,
}

impl UserRepository {
    /// Insert a user unless the email is taken
    pub async fn insert(&self, user: User) -> Result<(), UserError> {
        let mut tables = self.tables.write().await;
        let email = user.email.to_lowercase();
        if tables.emails.contains_key(&email) {
            return Err(UserError::DuplicateEmail(user.email));
        }
        tables.emails.insert(email, user.id);
        tables.users.insert(user.id, user);
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<User> {
        self.tables.read().await.users.get(&id).cloned()
    }

    pub async fn exists(&self, id: Uuid) -> bool {
        self.tables.read().await.users.contains_key(&id)
    }

    /// Append an order to the user's history; a repeated order id is
    /// ignored. Returns true if the order was new.
    pub async fn record_order(&self, user_id: Uuid, order: OrderSummary) -> bool {
        let mut tables = self.tables.write().await;
        let history = tables.orders.entry(user_id).or_default();
        if history.iter().any(|o| o.order_id == order.order_id) {
            return false;
        }
        history.push(order);
        true
    }

    pub async fn orders_for(&self, user_id: Uuid) -> Vec<OrderSummary> {
        self.tables
            .read()
            .await
            .orders
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct UserService {
    users: UserRepository,
    producer: Arc<EventProducer>,
}

impl UserService {
    pub fn new(users: UserRepository, producer: Arc<EventProducer>) -> Self {
        Self { users, producer }
    }

    /// Register a user and announce it
    ///
    /// The user is stored even if publishing `UserCreated` fails; the
    /// failure is only logged.
    pub async fn create_user(&self, request: NewUser) -> Result<User, UserError> {
        let name = request.name.trim();
        let email = request.email.trim();
        if name.is_empty() {
            return Err(UserError::Invalid("name is required".to_string()));
        }
        if !email.contains('@') {
            return Err(UserError::Invalid(format!("invalid email '{email}'")));
        }

        tracing::info!(name = %name, email = %email, "Creating user");
        let user = User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        self.users.insert(user.clone()).await?;
        tracing::info!(user_id = %user.id, "User created");

        let event = UserCreated {
            user_id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
        };
        if let Err(e) = self.producer.publish_event(&event).await {
            tracing::error!(
                user_id = %user.id,
                error = %e,
                "Failed to publish UserCreated; user kept"
            );
        }

        Ok(user)
    }

    pub async fn get_user(&self, id: Uuid) -> Option<User> {
        self.users.get(id).await
    }
}

/// Records orders announced by the orders service against the user
#[derive(Clone)]
pub struct OrderCreatedHandler {
    users: UserRepository,
}

impl OrderCreatedHandler {
    pub fn new(users: UserRepository) -> Self {
        Self { users }
    }
}

#[async_trait]
impl EventHandler<OrderCreated> for OrderCreatedHandler {
    async fn handle(&self, event: OrderCreated, ctx: &MessageContext) -> Result<(), HandlerError> {
        tracing::info!(
            order_id = %event.order_id,
            user_id = %event.user_id,
            product = %event.product,
            quantity = event.quantity,
            price = event.price,
            offset = ctx.offset,
            "Order received"
        );

        if !self.users.exists(event.user_id).await {
            tracing::warn!(
                order_id = %event.order_id,
                user_id = %event.user_id,
                "Order references an unknown user; ignoring"
            );
            return Ok(());
        }

        let summary = OrderSummary {
            order_id: event.order_id,
            product: event.product,
            quantity: event.quantity,
            price: event.price,
        };
        if !self.users.record_order(event.user_id, summary).await {
            tracing::debug!(order_id = %event.order_id, "Order already recorded");
        }
        Ok(())
    }
}
