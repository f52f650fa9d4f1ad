//! The wire contract for a propagated contact change.
//!
//! Encoded as JSON with the field names the order service has always
//! consumed (`userId`, `userEmails`, `deliveryAddress`). Absent optional
//! fields are omitted rather than sent as `null`, and decoding rejects
//! unknown fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::DeliveryAddress;

/// Describes which contact fields of a user changed, and to what value.
///
/// Created once by the publisher when a user write succeeds and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeEvent {
    /// Foreign key shared by the user record and every derived order.
    #[serde(rename = "userId")]
    pub entity_id: String,
    /// New email list, present only if it changed.
    #[serde(
        rename = "userEmails",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub emails: Option<Vec<String>>,
    /// New delivery address, present only if it changed.
    #[serde(
        rename = "deliveryAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub delivery_address: Option<DeliveryAddress>,
}

/// A payload that could not be decoded into a [`ChangeEvent`].
///
/// Redelivering the same bytes can never succeed, so consumers treat this
/// as a poison pill.
#[derive(Debug, Error)]
#[error("undecodable change event: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl ChangeEvent {
    pub fn new(
        entity_id: impl Into<String>,
        emails: Option<Vec<String>>,
        delivery_address: Option<DeliveryAddress>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            emails,
            delivery_address,
        }
    }

    /// An event carrying neither field. Consumers accept it as a no-op.
    pub fn is_noop(&self) -> bool {
        self.emails.is_none() && self.delivery_address.is_none()
    }

    /// Canonical byte encoding used on the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_omits_absent_fields() {
        let event = ChangeEvent::new("U1", Some(vec!["b@x.com".to_string()]), None);
        let json: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(json["userId"], "U1");
        assert_eq!(json["userEmails"][0], "b@x.com");
        assert!(json.get("deliveryAddress").is_none());
    }

    #[test]
    fn test_decode_accepts_null_optional_fields() {
        let event =
            ChangeEvent::from_slice(br#"{"userId":"U1","userEmails":null,"deliveryAddress":null}"#)
                .unwrap();
        assert_eq!(event.entity_id, "U1");
        assert!(event.is_noop());
    }

    #[test]
    fn test_decode_full_event() {
        let payload = br#"{
            "userId": "302015c6",
            "userEmails": ["new.email@example.org", "additional.email@example.org"],
            "deliveryAddress": {
                "street": "123 New Street",
                "city": "New City",
                "state": "NC",
                "postalCode": "27001",
                "country": "USA"
            }
        }"#;
        let event = ChangeEvent::from_slice(payload).unwrap();
        assert_eq!(event.emails.as_ref().map(Vec::len), Some(2));
        assert_eq!(
            event.delivery_address,
            Some(DeliveryAddress::new(
                "123 New Street",
                "New City",
                "NC",
                "27001",
                "USA"
            ))
        );
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(ChangeEvent::from_slice(b"not json").is_err());
        assert!(ChangeEvent::from_slice(br#"{"userEmails":["a@x.com"]}"#).is_err());
        assert!(ChangeEvent::from_slice(br#"{"userId":"U1","extra":1}"#).is_err());
        assert!(ChangeEvent::from_slice(br#"{"userId":"U1","deliveryAddress":"Main St"}"#).is_err());
    }
}
