//! Reference business callers of the messaging layer
//!
//! Thin in-memory versions of the orders and users services. They show the
//! two integration points: publishing after the primary write with
//! catch-and-log semantics, and handlers reacting to the other service's
//! events.

pub mod orders;
pub mod users;

pub use orders::{
    NewOrder, Order, OrderError, OrderRepository, OrderService, UserCreatedHandler,
    UserDirectory, UserRef, UserRefStore,
};
pub use users::{
    NewUser, OrderCreatedHandler, OrderSummary, User, UserError, UserRepository, UserService,
};
