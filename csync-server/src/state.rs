//! Application state shared across all request handlers.

use crate::config::Role;
use csync_core::events::ConsumerStateReceiver;
use csync_core::processors::UserContactWriter;
use csync_core::store::OrderStore;
use std::sync::Arc;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
/// Which parts are present depends on the role the process was started in.
#[derive(Clone)]
pub struct AppState {
    pub role: Role,
    /// Derived order records (order-service).
    pub orders: Option<Arc<dyn OrderStore>>,
    /// Source-side contact updates (user-service).
    pub contacts: Option<Arc<UserContactWriter>>,
    /// Lifecycle of the background consumer (order-service).
    pub consumer_state: Option<ConsumerStateReceiver>,
}

impl AppState {
    pub fn order_service(orders: Arc<dyn OrderStore>, consumer_state: ConsumerStateReceiver) -> Self {
        Self {
            role: Role::OrderService,
            orders: Some(orders),
            contacts: None,
            consumer_state: Some(consumer_state),
        }
    }

    pub fn user_service(contacts: Arc<UserContactWriter>) -> Self {
        Self {
            role: Role::UserService,
            orders: None,
            contacts: Some(contacts),
            consumer_state: None,
        }
    }
}
