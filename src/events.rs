//! Domain events exchanged between the orders and users services
//!
//! Field names are PascalCase on the wire so existing producers and
//! consumers keep interoperating. Unknown fields are ignored on decode.

use crate::types::Event;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An order was placed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub product: String,
    pub quantity: i32,
    pub price: f64,
}

impl Event for OrderCreated {
    const EVENT_TYPE: &'static str = "OrderCreated";

    fn partition_key(&self) -> String {
        self.order_id.to_string()
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("order:{}", self.order_id))
    }
}

/// A user account was registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserCreated {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
}

impl Event for UserCreated {
    const EVENT_TYPE: &'static str = "UserCreated";

    fn partition_key(&self) -> String {
        self.user_id.to_string()
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("user:{}", self.user_id))
    }
}
