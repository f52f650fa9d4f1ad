use serde::{Deserialize, Serialize};

/// Structured delivery address.
///
/// All five fields are required whenever an address is present, both on the
/// wire and in request bodies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeliveryAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

impl DeliveryAddress {
    pub fn new(
        street: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        postal_code: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            street: street.into(),
            city: city.into(),
            state: state.into(),
            postal_code: postal_code.into(),
            country: country.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_uses_camel_case_postal_code() {
        let address = DeliveryAddress::new("500 Oak Avenue", "Austin", "TX", "73301", "USA");
        let json = serde_json::to_value(&address).unwrap();
        assert_eq!(json["postalCode"], "73301");
        assert!(json.get("postal_code").is_none());
    }

    #[test]
    fn test_address_missing_field_is_rejected() {
        let json = r#"{"street":"1 Main","city":"X","state":"Y","country":"Z"}"#;
        assert!(serde_json::from_str::<DeliveryAddress>(json).is_err());
    }
}
