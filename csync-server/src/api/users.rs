//! User-service contact endpoints.
//!
//! # Endpoints
//!
//! - `GET /users/{user_id}/contact` – current contact fields
//! - `PUT /users/{user_id}/contact` – update emails and/or delivery address
//!
//! A successful `PUT` commits the user write before the change event is
//! published. A failed publish is reported in the response body and the
//! request still succeeds.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::get,
};
use csync_sdk::objects::{ContactUpdate, ContactUpdateResponse, UserContact};

use crate::api::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/users/{user_id}/contact", get(get_contact).put(update_contact))
}

async fn get_contact(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserContact>, ApiError> {
    let contacts = state.contacts.as_ref().ok_or(ApiError::NotServed)?;
    Ok(Json(contacts.get(&user_id).await?))
}

/// `PUT /users/{user_id}/contact`
///
/// Only `emails` and `deliveryAddress` are accepted; any other field is
/// rejected with 400.
async fn update_contact(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    payload: Result<Json<ContactUpdate>, JsonRejection>,
) -> Result<Json<ContactUpdateResponse>, ApiError> {
    let Json(update) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let contacts = state.contacts.as_ref().ok_or(ApiError::NotServed)?;

    let outcome = contacts.update(&user_id, update).await?;
    Ok(Json(ContactUpdateResponse {
        previous: outcome.previous,
        current: outcome.current,
        propagation: outcome.propagation,
    }))
}

#[cfg(test)]
mod tests {
    use crate::server::build_router;
    use crate::state::AppState;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use csync_core::broker::{InMemoryBroker, TopologyManager};
    use csync_core::processors::{PerCallPublisher, UserContactWriter};
    use csync_core::store::InMemoryUserStore;
    use csync_core::utils::Backoff;
    use csync_sdk::config::Topology;
    use csync_sdk::objects::{
        ChangeEvent, ContactUpdateResponse, DeliveryAddress, PropagationStatus, UserContact,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn address(street: &str) -> DeliveryAddress {
        DeliveryAddress::new(street, "Springfield", "IL", "62701", "US")
    }

    async fn fixture() -> (AppState, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        let users = Arc::new(InMemoryUserStore::new());
        users
            .insert(UserContact {
                user_id: "u-1".into(),
                emails: vec!["old@x.com".into()],
                delivery_address: address("1 Main St"),
            })
            .await;
        let topology = TopologyManager::new(
            Arc::new(broker.clone()),
            Topology::new("user_order", "order_service").unwrap(),
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        );
        let publisher = Arc::new(PerCallPublisher::new(topology, Duration::from_secs(1)));
        let writer = Arc::new(UserContactWriter::new(users, publisher));
        (AppState::user_service(writer), broker)
    }

    async fn put(state: AppState, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::put(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_get_contact() {
        let (state, _broker) = fixture().await;
        let response = build_router(state.clone())
            .oneshot(Request::get("/users/u-1/contact").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = build_router(state)
            .oneshot(Request::get("/users/u-9/contact").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_publishes_changed_fields() {
        let (state, broker) = fixture().await;
        let (status, body) = put(state, "/users/u-1/contact", r#"{"emails":["new@x.com"]}"#).await;
        assert_eq!(status, StatusCode::OK);

        let response: ContactUpdateResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.previous.emails, vec!["old@x.com".to_string()]);
        assert_eq!(response.current.emails, vec!["new@x.com".to_string()]);
        assert_eq!(response.propagation, PropagationStatus::Published);

        let queued = broker.peek("order_service");
        assert_eq!(queued.len(), 1);
        let event = ChangeEvent::from_slice(&queued[0].0).unwrap();
        assert_eq!(event.entity_id, "u-1");
        assert_eq!(event.emails, Some(vec!["new@x.com".to_string()]));
        assert_eq!(event.delivery_address, None);
    }

    #[tokio::test]
    async fn test_unknown_field_is_rejected() {
        let (state, broker) = fixture().await;
        let (status, _) = put(state, "/users/u-1/contact", r#"{"phone":"555"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(broker.peek("order_service").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_email_is_rejected() {
        let (state, _broker) = fixture().await;
        let (status, _) = put(state, "/users/u-1/contact", r#"{"emails":["nope"]}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broker_outage_keeps_the_write() {
        let (state, broker) = fixture().await;
        broker.refuse_next_connections(1);
        let (status, body) = put(
            state.clone(),
            "/users/u-1/contact",
            r#"{"deliveryAddress":{"street":"2 Elm St","city":"Springfield","state":"IL","postalCode":"62701","country":"US"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: ContactUpdateResponse = serde_json::from_slice(&body).unwrap();
        assert!(matches!(response.propagation, PropagationStatus::Failed { .. }));
        assert_eq!(response.current.delivery_address, address("2 Elm St"));
    }
}
