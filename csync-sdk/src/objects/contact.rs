//! Request and response types for the contact endpoints.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DeliveryAddress, is_valid_email};

/// Request body for `PUT /users/{user_id}/contact`.
///
/// Only `emails` and `deliveryAddress` are accepted; at least one must be
/// present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContactUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emails: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<DeliveryAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContactValidationError {
    #[error("either emails or deliveryAddress is required")]
    Empty,
    #[error("emails must be an array of valid email addresses")]
    InvalidEmail(String),
}

impl ContactUpdate {
    pub fn validate(&self) -> Result<(), ContactValidationError> {
        if self.emails.is_none() && self.delivery_address.is_none() {
            return Err(ContactValidationError::Empty);
        }
        if let Some(emails) = &self.emails {
            if let Some(bad) = emails.iter().find(|e| !is_valid_email(e)) {
                return Err(ContactValidationError::InvalidEmail(bad.clone()));
            }
        }
        Ok(())
    }
}

/// The contact fields of a user as stored by the user service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContact {
    pub user_id: String,
    pub emails: Vec<String>,
    pub delivery_address: DeliveryAddress,
}

/// What happened to the change event after the user write committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PropagationStatus {
    /// An event carrying the changed fields was handed to the broker.
    Published,
    /// Nothing changed, so no event was emitted.
    Unchanged,
    /// The write is committed but the event could not be published.
    Failed { reason: String },
}

/// Response body for `PUT /users/{user_id}/contact`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdateResponse {
    pub previous: UserContact,
    pub current: UserContact,
    pub propagation: PropagationStatus,
}

/// A derived order as returned by `GET /users/{user_id}/orders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub order_id: String,
    pub user_id: String,
    pub user_emails: Vec<String>,
    pub delivery_address: DeliveryAddress,
    pub order_status: String,
}
