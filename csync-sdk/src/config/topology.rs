//! Exchange, queue and binding names for one deployment.

use super::ConfigValueError;

/// Where repeatedly failing events are parked instead of being redelivered forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Durable queue receiving dead-lettered events. Bound to the topology's
    /// exchange with its own name as routing key.
    pub queue: String,
    /// Deliveries allowed (first attempt included) before an event is dead-lettered.
    pub max_attempts: u32,
}

/// The (exchange, routing key, queue) triple connecting publishers to a consumer role.
///
/// The routing key always equals the queue name: one logical queue per
/// consuming service, matched exactly by a direct exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    queue: String,
    dead_letter: Option<DeadLetterPolicy>,
}

impl Topology {
    pub const DEFAULT_EXCHANGE: &'static str = "user_order";

    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Result<Self, ConfigValueError> {
        let exchange = exchange.into();
        let queue = queue.into();
        if exchange.trim().is_empty() {
            return Err(ConfigValueError::new("broker.exchange", "must not be empty"));
        }
        if queue.trim().is_empty() {
            return Err(ConfigValueError::new("broker.queue", "must not be empty"));
        }
        if exchange.starts_with("amq.") {
            return Err(ConfigValueError::new(
                "broker.exchange",
                "the amq. prefix is reserved by the broker",
            ));
        }
        Ok(Self {
            exchange,
            queue,
            dead_letter: None,
        })
    }

    pub fn with_dead_letter(mut self, policy: DeadLetterPolicy) -> Result<Self, ConfigValueError> {
        if policy.queue.trim().is_empty() {
            return Err(ConfigValueError::new("dead_letter.queue", "must not be empty"));
        }
        if policy.queue == self.queue {
            return Err(ConfigValueError::new(
                "dead_letter.queue",
                "must differ from the work queue",
            ));
        }
        if policy.max_attempts == 0 {
            return Err(ConfigValueError::new(
                "dead_letter.max_attempts",
                "must be at least 1",
            ));
        }
        self.dead_letter = Some(policy);
        Ok(self)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.queue
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterPolicy> {
        self.dead_letter.as_ref()
    }
}
