pub mod address;
pub mod change_event;
pub mod contact;

pub use address::DeliveryAddress;
pub use change_event::{ChangeEvent, DecodeError};
pub use contact::{
    ContactUpdate, ContactUpdateResponse, ContactValidationError, OrderSummary,
    PropagationStatus, UserContact,
};

/// Returns true if the string looks like an email address.
///
/// Matches the check the user and order services have always applied:
/// the address only has to contain an `@`.
pub fn is_valid_email(email: &str) -> bool {
    email.contains('@')
}
