//! HTTP API handlers.
//!
//! Each role serves only its own side of the pipeline:
//!
//! - order-service: `GET /users/{user_id}/orders`
//! - user-service: `GET /users/{user_id}/contact`, `PUT /users/{user_id}/contact`

pub mod orders;
pub mod users;

use axum::{Router, http::StatusCode, response::IntoResponse};
use csync_core::processors::ContactWriteError;
use csync_core::store::StoreError;

use crate::config::Role;
use crate::state::AppState;

/// Build the API router for the given role.
pub fn router(role: Role) -> Router<AppState> {
    match role {
        Role::OrderService => orders::router(),
        Role::UserService => users::router(),
    }
}

/// Errors that can occur in API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The request body or path was rejected.
    BadRequest(String),
    /// The requested user does not exist.
    NotFound(String),
    /// A store operation failed.
    Store(StoreError),
    /// The route exists but this process was started without its backing state.
    NotServed,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<ContactWriteError> for ApiError {
    fn from(e: ContactWriteError) -> Self {
        match e {
            ContactWriteError::Invalid(e) => ApiError::BadRequest(e.to_string()),
            ContactWriteError::NotFound(user_id) => ApiError::NotFound(user_id),
            ContactWriteError::Store(e) => ApiError::Store(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            ApiError::NotFound(user_id) => {
                (StatusCode::NOT_FOUND, format!("user not found: {user_id}")).into_response()
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "API store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
            ApiError::NotServed => (StatusCode::NOT_FOUND, "not served by this role").into_response(),
        }
    }
}
