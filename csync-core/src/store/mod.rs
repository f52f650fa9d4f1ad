//! Storage seams for the two sides of contact propagation.
//!
//! - [`OrderStore`]: the derived order records the consumer patches.
//! - [`UserStore`]: the source user records the contact writer updates.
//!
//! [`DatabaseProcessor`](crate::framework::DatabaseProcessor) implements both
//! against Postgres; [`in_memory`] provides the same contract for tests.

pub mod in_memory;
mod postgres;

use crate::entities::order_records::OrderRecord;
use async_trait::async_trait;
use csync_sdk::objects::{ChangeEvent, DeliveryAddress, UserContact};
use thiserror::Error;

pub use in_memory::{InMemoryOrderStore, InMemoryUserStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The contact fields to overwrite. `None` means leave as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactPatch {
    pub emails: Option<Vec<String>>,
    pub delivery_address: Option<DeliveryAddress>,
}

impl ContactPatch {
    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            emails: event.emails.clone(),
            delivery_address: event.delivery_address.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_none() && self.delivery_address.is_none()
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<OrderRecord>, StoreError>;

    /// Overwrite the contact copies of one order. Returns `false` if the
    /// order no longer exists.
    async fn patch_contact(&self, order_id: &str, patch: &ContactPatch) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_contact(&self, user_id: &str) -> Result<Option<UserContact>, StoreError>;

    /// Apply `patch` and return the stored contact, or `None` for an
    /// unknown user.
    async fn patch_contact(
        &self,
        user_id: &str,
        patch: &ContactPatch,
    ) -> Result<Option<UserContact>, StoreError>;
}
