//! Source-side write path for user contact fields.
//!
//! Updates the user record first and only then publishes a change event
//! carrying the fields whose value actually changed. A failed publish never
//! undoes the committed write; it is reported back to the caller instead.

use crate::processors::publisher::EventPublisher;
use crate::store::{ContactPatch, StoreError, UserStore};
use csync_sdk::objects::{
    ChangeEvent, ContactUpdate, ContactValidationError, PropagationStatus, UserContact,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ContactWriteError {
    #[error(transparent)]
    Invalid(#[from] ContactValidationError),
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactUpdateOutcome {
    pub previous: UserContact,
    pub current: UserContact,
    pub propagation: PropagationStatus,
}

pub struct UserContactWriter {
    users: Arc<dyn UserStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl UserContactWriter {
    pub fn new(users: Arc<dyn UserStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { users, publisher }
    }

    pub async fn get(&self, user_id: &str) -> Result<UserContact, ContactWriteError> {
        self.users
            .get_contact(user_id)
            .await?
            .ok_or_else(|| ContactWriteError::NotFound(user_id.to_string()))
    }

    #[tracing::instrument(skip(self, update), err)]
    pub async fn update(
        &self,
        user_id: &str,
        update: ContactUpdate,
    ) -> Result<ContactUpdateOutcome, ContactWriteError> {
        update.validate()?;
        let previous = self.get(user_id).await?;

        let patch = ContactPatch {
            emails: update.emails.filter(|emails| *emails != previous.emails),
            delivery_address: update
                .delivery_address
                .filter(|address| *address != previous.delivery_address),
        };
        if patch.is_empty() {
            info!("Contact unchanged, nothing to propagate");
            return Ok(ContactUpdateOutcome {
                current: previous.clone(),
                previous,
                propagation: PropagationStatus::Unchanged,
            });
        }

        let current = self
            .users
            .patch_contact(user_id, &patch)
            .await?
            .ok_or_else(|| ContactWriteError::NotFound(user_id.to_string()))?;

        let event = ChangeEvent::new(user_id, patch.emails, patch.delivery_address);
        let propagation = match self.publisher.publish(&event).await {
            Ok(()) => PropagationStatus::Published,
            Err(e) => {
                error!(error = %e, "Contact updated but change event was not published");
                PropagationStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };

        Ok(ContactUpdateOutcome {
            previous,
            current,
            propagation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::publisher::PublishError;
    use crate::store::InMemoryUserStore;
    use async_trait::async_trait;
    use csync_sdk::objects::DeliveryAddress;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CapturingPublisher {
        events: Mutex<Vec<ChangeEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl EventPublisher for CapturingPublisher {
        async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Timeout(Duration::from_secs(5)));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn address(street: &str) -> DeliveryAddress {
        DeliveryAddress::new(street, "Springfield", "IL", "62701", "US")
    }

    async fn writer(fail: bool) -> (UserContactWriter, Arc<CapturingPublisher>) {
        let users = Arc::new(InMemoryUserStore::new());
        users
            .insert(UserContact {
                user_id: "u-1".into(),
                emails: vec!["a@x.io".into()],
                delivery_address: address("1 Main"),
            })
            .await;
        let publisher = Arc::new(CapturingPublisher {
            fail,
            ..Default::default()
        });
        (UserContactWriter::new(users, publisher.clone()), publisher)
    }

    #[tokio::test]
    async fn test_publishes_only_changed_fields() {
        let (writer, publisher) = writer(false).await;
        let outcome = writer
            .update(
                "u-1",
                ContactUpdate {
                    emails: Some(vec!["a@x.io".into()]),
                    delivery_address: Some(address("2 Oak")),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.propagation, PropagationStatus::Published);
        assert_eq!(outcome.current.delivery_address, address("2 Oak"));
        let events = publisher.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![ChangeEvent::new("u-1", None, Some(address("2 Oak")))]
        );
    }

    #[tokio::test]
    async fn test_unchanged_contact_publishes_nothing() {
        let (writer, publisher) = writer(false).await;
        let outcome = writer
            .update(
                "u-1",
                ContactUpdate {
                    emails: Some(vec!["a@x.io".into()]),
                    delivery_address: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.propagation, PropagationStatus::Unchanged);
        assert_eq!(outcome.previous, outcome.current);
        assert!(publisher.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_the_write() {
        let (writer, _) = writer(true).await;
        let outcome = writer
            .update(
                "u-1",
                ContactUpdate {
                    emails: Some(vec!["b@x.io".into()]),
                    delivery_address: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome.propagation, PropagationStatus::Failed { .. }));
        assert_eq!(writer.get("u-1").await.unwrap().emails, vec!["b@x.io".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_and_unknown() {
        let (writer, _) = writer(false).await;
        assert!(matches!(
            writer.update("u-1", ContactUpdate::default()).await,
            Err(ContactWriteError::Invalid(ContactValidationError::Empty))
        ));
        assert!(matches!(
            writer
                .update(
                    "u-1",
                    ContactUpdate {
                        emails: Some(vec!["nope".into()]),
                        delivery_address: None,
                    }
                )
                .await,
            Err(ContactWriteError::Invalid(_))
        ));
        assert!(matches!(
            writer
                .update(
                    "ghost",
                    ContactUpdate {
                        emails: Some(vec!["a@x.io".into()]),
                        delivery_address: None,
                    }
                )
                .await,
            Err(ContactWriteError::NotFound(_))
        ));
    }
}
