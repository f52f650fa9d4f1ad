//! Consumer and publisher tuning.

use std::time::Duration;

use super::ConfigValueError;

/// Settings for the single background consumer of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries the broker may push ahead of processing.
    /// Only 1 is accepted: a delivery buffered behind a requeued one would
    /// be handled before it.
    pub prefetch: u16,
    /// First reconnect delay after a connection failure or loss.
    pub reconnect_initial: Duration,
    /// Cap for the reconnect delay.
    pub reconnect_max: Duration,
    /// Pause before a failed delivery is retried or handed back to the broker.
    pub requeue_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            requeue_delay: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ConfigValueError> {
        if self.prefetch != 1 {
            return Err(ConfigValueError::new(
                "consumer.prefetch",
                "must be 1 so deliveries are handled in queue order",
            ));
        }
        if self.reconnect_initial > self.reconnect_max {
            return Err(ConfigValueError::new(
                "consumer.reconnect_initial_ms",
                "must not exceed consumer.reconnect_max_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherMode {
    /// Open a connection for every event and close it afterwards.
    PerCall,
    /// Keep one connection open and reconnect when it breaks.
    Pooled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub mode: PublisherMode,
    /// Upper bound on a single publish, connection setup included.
    pub timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            mode: PublisherMode::Pooled,
            timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefetch_must_be_one() {
        assert!(ConsumerConfig::default().validate().is_ok());
        for prefetch in [0, 2, 16] {
            let config = ConsumerConfig {
                prefetch,
                ..Default::default()
            };
            let err = config.validate().unwrap_err();
            assert_eq!(err.field, "consumer.prefetch");
        }
    }
}
