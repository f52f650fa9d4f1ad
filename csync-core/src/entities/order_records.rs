use crate::framework::DatabaseProcessor;
use csync_sdk::objects::{DeliveryAddress, OrderSummary};
use kanau::processor::Processor;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub item_id: String,
    pub quantity: u32,
    pub price: rust_decimal::Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "under process")]
    UnderProcess,
    #[serde(rename = "shipping")]
    Shipping,
    #[serde(rename = "delivered")]
    Delivered,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::UnderProcess => "under process",
            OrderStatus::Shipping => "shipping",
            OrderStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownOrderStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownOrderStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "under process" => Ok(OrderStatus::UnderProcess),
            "shipping" => Ok(OrderStatus::Shipping),
            "delivered" => Ok(OrderStatus::Delivered),
            other => Err(UnknownOrderStatus(other.to_string())),
        }
    }
}

/// A derived record owned by the order service.
///
/// `user_emails` and `delivery_address` are denormalized copies of the
/// owning user's contact fields, kept in sync by change propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub order_id: String,
    pub user_id: String,
    pub items: Vec<OrderItem>,
    pub user_emails: Vec<String>,
    pub delivery_address: DeliveryAddress,
    pub order_status: OrderStatus,
    pub created_at: time::PrimitiveDateTime,
    pub updated_at: time::PrimitiveDateTime,
}

impl OrderRecord {
    /// A freshly placed order.
    pub fn new(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        items: Vec<OrderItem>,
        user_emails: Vec<String>,
        delivery_address: DeliveryAddress,
    ) -> Self {
        let now = super::now_primitive();
        Self {
            order_id: order_id.into(),
            user_id: user_id.into(),
            items,
            user_emails,
            delivery_address,
            order_status: OrderStatus::UnderProcess,
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<OrderRecord> for OrderSummary {
    fn from(record: OrderRecord) -> Self {
        OrderSummary {
            order_id: record.order_id,
            user_id: record.user_id,
            user_emails: record.user_emails,
            delivery_address: record.delivery_address,
            order_status: record.order_status.to_string(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    order_id: String,
    user_id: String,
    items: Json<Vec<OrderItem>>,
    user_emails: Vec<String>,
    delivery_address: Json<DeliveryAddress>,
    order_status: String,
    created_at: time::PrimitiveDateTime,
    updated_at: time::PrimitiveDateTime,
}

impl TryFrom<OrderRow> for OrderRecord {
    type Error = sqlx::Error;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let order_status = row
            .order_status
            .parse::<OrderStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(OrderRecord {
            order_id: row.order_id,
            user_id: row.user_id,
            items: row.items.0,
            user_emails: row.user_emails,
            delivery_address: row.delivery_address.0,
            order_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
/// Every order derived from one user.
pub struct FindOrdersByUserId {
    pub user_id: String,
}

impl Processor<FindOrdersByUserId> for DatabaseProcessor {
    type Output = Vec<OrderRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:FindOrdersByUserId")]
    async fn process(&self, query: FindOrdersByUserId) -> Result<Vec<OrderRecord>, sqlx::Error> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT order_id, user_id, items, user_emails, delivery_address,
                   order_status, created_at, updated_at
            FROM orders
            WHERE user_id = $1
            ORDER BY created_at, order_id
            "#,
        )
        .bind(&query.user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OrderRecord::try_from).collect()
    }
}

#[derive(Debug, Clone)]
/// Overwrite the contact copies on one order.
///
/// `None` fields are left untouched. Returns whether the order still existed.
pub struct PatchOrderContact {
    pub order_id: String,
    pub user_emails: Option<Vec<String>>,
    pub delivery_address: Option<DeliveryAddress>,
}

impl Processor<PatchOrderContact> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PatchOrderContact")]
    async fn process(&self, query: PatchOrderContact) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET user_emails = COALESCE($2, user_emails),
                delivery_address = COALESCE($3, delivery_address),
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(&query.order_id)
        .bind(query.user_emails)
        .bind(query.delivery_address.map(Json))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_text_form() {
        for status in [
            OrderStatus::UnderProcess,
            OrderStatus::Shipping,
            OrderStatus::Delivered,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert_eq!(
            serde_json::to_string(&OrderStatus::UnderProcess).unwrap(),
            "\"under process\""
        );
        assert!("cancelled".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_new_order_starts_under_process() {
        let address = DeliveryAddress::new("1 Main St", "Springfield", "IL", "62701", "US");
        let order = OrderRecord::new("o-1", "u-1", vec![], vec!["a@x.io".into()], address);
        assert_eq!(order.order_status, OrderStatus::UnderProcess);
        assert_eq!(order.created_at, order.updated_at);

        let summary = OrderSummary::from(order);
        assert_eq!(summary.order_status, "under process");
        assert_eq!(summary.user_emails, vec!["a@x.io".to_string()]);
    }
}
