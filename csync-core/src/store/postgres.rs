use super::{ContactPatch, OrderStore, StoreError, UserStore};
use crate::entities::order_records::{FindOrdersByUserId, OrderRecord, PatchOrderContact};
use crate::entities::user_records::{GetUserContact, PatchUserContact};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use csync_sdk::objects::UserContact;
use kanau::processor::Processor;

#[async_trait]
impl OrderStore for DatabaseProcessor {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<OrderRecord>, StoreError> {
        let orders = self
            .process(FindOrdersByUserId {
                user_id: user_id.to_string(),
            })
            .await?;
        Ok(orders)
    }

    async fn patch_contact(&self, order_id: &str, patch: &ContactPatch) -> Result<bool, StoreError> {
        let found = self
            .process(PatchOrderContact {
                order_id: order_id.to_string(),
                user_emails: patch.emails.clone(),
                delivery_address: patch.delivery_address.clone(),
            })
            .await?;
        Ok(found)
    }
}

#[async_trait]
impl UserStore for DatabaseProcessor {
    async fn get_contact(&self, user_id: &str) -> Result<Option<UserContact>, StoreError> {
        let contact = self
            .process(GetUserContact {
                user_id: user_id.to_string(),
            })
            .await?;
        Ok(contact)
    }

    async fn patch_contact(
        &self,
        user_id: &str,
        patch: &ContactPatch,
    ) -> Result<Option<UserContact>, StoreError> {
        let contact = self
            .process(PatchUserContact {
                user_id: user_id.to_string(),
                emails: patch.emails.clone(),
                delivery_address: patch.delivery_address.clone(),
            })
            .await?;
        Ok(contact)
    }
}
