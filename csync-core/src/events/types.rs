use std::fmt;

/// Lifecycle of the background consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// Not running, or stopped for good.
    Stopped,
    /// Connecting to the broker or declaring topology.
    Connecting,
    /// Subscribed and handling deliveries.
    Subscribed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Stopped => "stopped",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Subscribed => "subscribed",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Applied and acknowledged. Carries the number of orders updated.
    Applied { updated: u64 },
    /// Acknowledged without effect: undecodable or permanently invalid.
    Dropped,
    /// Handed back to the broker for redelivery.
    Requeued,
    /// Moved to the dead-letter queue after exhausting its attempts.
    DeadLettered,
}
