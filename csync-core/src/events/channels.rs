use super::types::ConsumerState;
use tokio::sync::watch;

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub type ConsumerStateSender = watch::Sender<ConsumerState>;
pub type ConsumerStateReceiver = watch::Receiver<ConsumerState>;

/// Create the process-wide shutdown signal. Send `true` to stop.
pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

pub fn consumer_state_channel() -> (ConsumerStateSender, ConsumerStateReceiver) {
    watch::channel(ConsumerState::Stopped)
}
