//! Message broker plumbing.
//!
//! The rest of the crate talks to the broker only through the traits here:
//!
//! - [`BrokerConnector`] opens sessions (one connection plus one channel).
//! - [`BrokerSession`] declares topology, publishes, consumes and settles.
//! - [`DeliveryStream`] yields inbound deliveries for one subscription.
//!
//! [`amqp`] implements them over RabbitMQ, [`in_memory`] inside the process.

pub mod amqp;
pub mod in_memory;
pub mod topology;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub use amqp::AmqpConnector;
pub use in_memory::InMemoryBroker;
pub use topology::{ConsumeHandle, PublishHandle, TopologyHandles, TopologyManager};

/// Header carrying how many times a message has been attempted.
pub const ATTEMPT_HEADER: &str = "x-csync-attempt";
/// Header carrying why a message was dead-lettered.
pub const FAILURE_HEADER: &str = "x-csync-failure";

pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub headers: Headers,
}

impl InboundDelivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 1-based attempt number, read from [`ATTEMPT_HEADER`].
    pub fn attempt(&self) -> u32 {
        self.header(ATTEMPT_HEADER)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("invalid broker configuration: {0}")]
    Configuration(String),
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker channel error: {0}")]
    Channel(String),
    #[error("failed to declare {name}: {reason}")]
    Topology { name: String, reason: String },
    #[error("publish with routing key {routing_key} failed: {reason}")]
    Publish { routing_key: String, reason: String },
    #[error("broker session closed: {0}")]
    Closed(String),
}

impl BrokerError {
    /// Whether retrying with a fresh session can help.
    ///
    /// Configuration errors (bad credentials, conflicting declarations)
    /// will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BrokerError::Configuration(_))
    }
}

#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Session: BrokerSession;

    async fn connect(&self) -> Result<Self::Session, BrokerError>;

    /// Where this connector points, safe to log.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    type Deliveries: DeliveryStream;

    /// Declare a durable direct exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;
    /// Declare a durable queue.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), BrokerError>;

    /// Publish a persistent message and wait for the broker to confirm it.
    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Self::Deliveries, BrokerError>;
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the session. Unacknowledged deliveries return to their queue.
    async fn close(&self) -> Result<(), BrokerError>;
    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait DeliveryStream: Send + 'static {
    /// Next delivery, or `None` once the subscription has ended.
    ///
    /// Cancel safe: dropping the future never loses a delivery.
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, BrokerError>>;
}
