//! Process-local stores with failure injection.

use super::{ContactPatch, OrderStore, StoreError, UserStore};
use crate::entities::now_primitive;
use crate::entities::order_records::OrderRecord;
use async_trait::async_trait;
use csync_sdk::objects::UserContact;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Consume one injected failure, if any are left.
fn take_failure(counter: &AtomicU32) -> Result<(), StoreError> {
    let took = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if took {
        Err(StoreError::Unavailable("injected failure".to_string()))
    } else {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<BTreeMap<String, OrderRecord>>,
    failures: AtomicU32,
    writes: AtomicU64,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order: OrderRecord) {
        self.orders
            .write()
            .await
            .insert(order.order_id.clone(), order);
    }

    pub async fn get(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.read().await.get(order_id).cloned()
    }

    pub async fn remove(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.write().await.remove(order_id)
    }

    /// Make the next `n` store calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of successful contact patches so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<OrderRecord>, StoreError> {
        take_failure(&self.failures)?;
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn patch_contact(&self, order_id: &str, patch: &ContactPatch) -> Result<bool, StoreError> {
        take_failure(&self.failures)?;
        let mut orders = self.orders.write().await;
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(false);
        };
        if let Some(emails) = &patch.emails {
            order.user_emails = emails.clone();
        }
        if let Some(address) = &patch.delivery_address {
            order.delivery_address = address.clone();
        }
        order.updated_at = now_primitive();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<BTreeMap<String, UserContact>>,
    failures: AtomicU32,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, contact: UserContact) {
        self.users
            .write()
            .await
            .insert(contact.user_id.clone(), contact);
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_contact(&self, user_id: &str) -> Result<Option<UserContact>, StoreError> {
        take_failure(&self.failures)?;
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn patch_contact(
        &self,
        user_id: &str,
        patch: &ContactPatch,
    ) -> Result<Option<UserContact>, StoreError> {
        take_failure(&self.failures)?;
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(user_id) else {
            return Ok(None);
        };
        if let Some(emails) = &patch.emails {
            user.emails = emails.clone();
        }
        if let Some(address) = &patch.delivery_address {
            user.delivery_address = address.clone();
        }
        Ok(Some(user.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csync_sdk::objects::DeliveryAddress;

    fn address(street: &str) -> DeliveryAddress {
        DeliveryAddress::new(street, "Springfield", "IL", "62701", "US")
    }

    #[tokio::test]
    async fn test_patch_only_touches_present_fields() {
        let store = InMemoryOrderStore::new();
        store
            .insert(OrderRecord::new("o-1", "u-1", vec![], vec!["a@x.io".into()], address("1 Main")))
            .await;

        let patch = ContactPatch {
            emails: Some(vec!["b@x.io".into()]),
            delivery_address: None,
        };
        assert!(store.patch_contact("o-1", &patch).await.unwrap());

        let order = store.get("o-1").await.unwrap();
        assert_eq!(order.user_emails, vec!["b@x.io".to_string()]);
        assert_eq!(order.delivery_address, address("1 Main"));
    }

    #[tokio::test]
    async fn test_patch_missing_order_reports_false() {
        let store = InMemoryOrderStore::new();
        let patch = ContactPatch {
            emails: Some(vec![]),
            delivery_address: None,
        };
        assert!(!store.patch_contact("gone", &patch).await.unwrap());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryOrderStore::new();
        store.fail_next(2);
        assert!(store.find_by_user_id("u-1").await.is_err());
        assert!(store.find_by_user_id("u-1").await.is_err());
        assert!(store.find_by_user_id("u-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_patch_returns_stored_contact() {
        let store = InMemoryUserStore::new();
        store
            .insert(UserContact {
                user_id: "u-1".into(),
                emails: vec!["a@x.io".into()],
                delivery_address: address("1 Main"),
            })
            .await;

        let patch = ContactPatch {
            emails: None,
            delivery_address: Some(address("2 Oak")),
        };
        let updated = store.patch_contact("u-1", &patch).await.unwrap().unwrap();
        assert_eq!(updated.emails, vec!["a@x.io".to_string()]);
        assert_eq!(updated.delivery_address, address("2 Oak"));
        assert!(store.patch_contact("nobody", &patch).await.unwrap().is_none());
    }
}
