//! Applies a change event to every derived order of the entity.
//!
//! Each present field is an absolute overwrite, so applying the same event
//! twice leaves the orders exactly as applying it once.

use crate::store::{ContactPatch, OrderStore, StoreError};
use async_trait::async_trait;
use csync_sdk::objects::{ChangeEvent, is_valid_email};
use kanau::processor::Processor;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid change event: {0}")]
    InvalidEvent(String),
}

impl ApplyError {
    /// Whether applying the same event again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Store(_))
    }
}

/// Something that can apply a decoded change event.
///
/// Returns the number of derived records updated.
#[async_trait]
pub trait ChangeEventHandler: Send + Sync {
    async fn handle(&self, event: ChangeEvent) -> Result<u64, ApplyError>;
}

pub struct PropagationApplier {
    orders: Arc<dyn OrderStore>,
}

impl PropagationApplier {
    pub fn new(orders: Arc<dyn OrderStore>) -> Self {
        Self { orders }
    }

    fn validate(event: &ChangeEvent) -> Result<(), ApplyError> {
        if event.entity_id.trim().is_empty() {
            return Err(ApplyError::InvalidEvent("userId is empty".to_string()));
        }
        if let Some(emails) = &event.emails {
            if let Some(bad) = emails.iter().find(|e| !is_valid_email(e)) {
                return Err(ApplyError::InvalidEvent(format!(
                    "invalid email address: {bad}"
                )));
            }
        }
        Ok(())
    }
}

impl Processor<ChangeEvent> for PropagationApplier {
    type Output = u64;
    type Error = ApplyError;
    #[tracing::instrument(skip_all, err, fields(entity_id = %event.entity_id))]
    async fn process(&self, event: ChangeEvent) -> Result<u64, ApplyError> {
        Self::validate(&event)?;
        let patch = ContactPatch::from_event(&event);
        if patch.is_empty() {
            debug!("Change event carries no fields, nothing to apply");
            return Ok(0);
        }

        let orders = self.orders.find_by_user_id(&event.entity_id).await?;
        let mut updated = 0u64;
        for order in &orders {
            if self.orders.patch_contact(&order.order_id, &patch).await? {
                updated += 1;
            } else {
                debug!(order_id = %order.order_id, "Order disappeared before patch");
            }
        }

        info!(
            updated,
            emails = patch.emails.is_some(),
            delivery_address = patch.delivery_address.is_some(),
            "Applied change event"
        );
        Ok(updated)
    }
}

#[async_trait]
impl ChangeEventHandler for PropagationApplier {
    async fn handle(&self, event: ChangeEvent) -> Result<u64, ApplyError> {
        self.process(event).await
    }
}
