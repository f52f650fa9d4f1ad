use crate::framework::DatabaseProcessor;
use csync_sdk::objects::{DeliveryAddress, UserContact};
use kanau::processor::Processor;
use sqlx::types::Json;

#[derive(Debug, sqlx::FromRow)]
struct UserContactRow {
    user_id: String,
    emails: Vec<String>,
    delivery_address: Json<DeliveryAddress>,
}

impl From<UserContactRow> for UserContact {
    fn from(row: UserContactRow) -> Self {
        UserContact {
            user_id: row.user_id,
            emails: row.emails,
            delivery_address: row.delivery_address.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetUserContact {
    pub user_id: String,
}

impl Processor<GetUserContact> for DatabaseProcessor {
    type Output = Option<UserContact>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetUserContact")]
    async fn process(&self, query: GetUserContact) -> Result<Option<UserContact>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserContactRow>(
            r#"
            SELECT user_id, emails, delivery_address
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(&query.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserContact::from))
    }
}

#[derive(Debug, Clone)]
/// Write the given contact fields of one user and return the stored result.
///
/// `None` fields keep their current value.
pub struct PatchUserContact {
    pub user_id: String,
    pub emails: Option<Vec<String>>,
    pub delivery_address: Option<DeliveryAddress>,
}

impl Processor<PatchUserContact> for DatabaseProcessor {
    type Output = Option<UserContact>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PatchUserContact")]
    async fn process(&self, query: PatchUserContact) -> Result<Option<UserContact>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserContactRow>(
            r#"
            UPDATE users
            SET emails = COALESCE($2, emails),
                delivery_address = COALESCE($3, delivery_address),
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, emails, delivery_address
            "#,
        )
        .bind(&query.user_id)
        .bind(query.emails)
        .bind(query.delivery_address.map(Json))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserContact::from))
    }
}
