//! Order-service read endpoint.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use csync_sdk::objects::OrderSummary;

use crate::api::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/users/{user_id}/orders", get(list_orders))
}

/// `GET /users/{user_id}/orders` — every derived order of a user.
///
/// A user without orders gets an empty list.
async fn list_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<OrderSummary>>, ApiError> {
    let orders = state.orders.as_ref().ok_or(ApiError::NotServed)?;
    let records = orders.find_by_user_id(&user_id).await?;
    Ok(Json(records.into_iter().map(OrderSummary::from).collect()))
}
