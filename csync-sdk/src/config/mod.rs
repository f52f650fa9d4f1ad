//! Runtime configuration types for the contact-sync pipeline.
//!
//! These types represent validated configuration values and are shared by
//! the core and server crates. Loading and parsing is handled by the server.

mod broker;
mod consumer;
mod server;
mod topology;

pub use broker::BrokerConfig;
pub use consumer::{ConsumerConfig, PublisherConfig, PublisherMode};
pub use server::ServerConfig;
pub use topology::{DeadLetterPolicy, Topology};

use thiserror::Error;

/// A configuration value that can never work, no matter how often it is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigValueError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigValueError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
