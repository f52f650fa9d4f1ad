//! In-process signals shared between the background consumer and the
//! rest of the service.
//!
//! - A `watch<bool>` shutdown signal, flipped once to stop every loop.
//! - A `watch<ConsumerState>` that readiness checks observe.

pub mod channels;
pub mod types;

pub use channels::{
    ConsumerStateReceiver, ConsumerStateSender, ShutdownReceiver, ShutdownSender,
    consumer_state_channel, shutdown_channel,
};
pub use types::{ConsumerState, DeliveryOutcome};
