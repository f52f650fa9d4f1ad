//! Keeps the one background consumer of a process alive.
//!
//! The supervisor runs the [`Dispatcher`] in its own task. If the task
//! panics or returns without being asked to, the whole consume cycle is
//! restarted from scratch after a backoff. A non-transient broker error or
//! the shutdown signal ends supervision.

use crate::broker::BrokerConnector;
use crate::events::ConsumerState;
use crate::processors::dispatcher::{DispatchError, Dispatcher};
use crate::utils::{Backoff, sleep_or_shutdown};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Why supervision ended.
#[derive(Debug)]
pub enum SupervisorExit {
    Shutdown,
    Failed(DispatchError),
}

pub struct ConsumerSupervisor<C: BrokerConnector> {
    dispatcher: Dispatcher<C>,
    restart_backoff: Backoff,
}

impl<C: BrokerConnector> ConsumerSupervisor<C> {
    pub fn new(dispatcher: Dispatcher<C>, restart_backoff: Backoff) -> Self {
        Self {
            dispatcher,
            restart_backoff,
        }
    }

    /// Start supervising in a background task.
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> SupervisorHandle {
        let join = tokio::spawn(self.run(shutdown_rx));
        SupervisorHandle { join }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> SupervisorExit {
        info!("ConsumerSupervisor started");
        let mut restarts: u32 = 0;

        let exit = loop {
            if *shutdown_rx.borrow() {
                break SupervisorExit::Shutdown;
            }

            let dispatcher = self.dispatcher.clone();
            let rx = shutdown_rx.clone();
            let task = tokio::spawn(async move { dispatcher.run(rx).await });

            match task.await {
                Ok(Ok(())) => {
                    if *shutdown_rx.borrow() {
                        break SupervisorExit::Shutdown;
                    }
                    warn!("Dispatcher returned unexpectedly, restarting");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Dispatcher failed permanently");
                    break SupervisorExit::Failed(e);
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(restarts, "Dispatcher panicked, restarting");
                }
                Err(_) => {
                    warn!("Dispatcher task was cancelled");
                    break SupervisorExit::Shutdown;
                }
            }

            self.dispatcher.set_state(ConsumerState::Connecting);
            let delay = self.restart_backoff.delay(restarts);
            restarts = restarts.saturating_add(1);
            if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                break SupervisorExit::Shutdown;
            }
        };

        self.dispatcher.set_state(ConsumerState::Stopped);
        info!("ConsumerSupervisor shutdown complete");
        exit
    }
}

pub struct SupervisorHandle {
    join: JoinHandle<SupervisorExit>,
}

impl SupervisorHandle {
    /// Wait for supervision to end, for at most `grace` after shutdown was
    /// signaled. The task is aborted if it does not finish in time, which
    /// returns any in-flight delivery to the broker.
    pub async fn join(self, grace: Duration) -> Option<SupervisorExit> {
        let mut join = self.join;
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                error!(error = %e, "Supervisor task failed");
                None
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Consumer did not stop in time, aborting");
                join.abort();
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, OutboundMessage, TopologyManager};
    use crate::processors::applier::{ApplyError, ChangeEventHandler};
    use async_trait::async_trait;
    use csync_sdk::config::{ConsumerConfig, Topology};
    use csync_sdk::objects::ChangeEvent;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Panics on its first call, counts the rest.
    #[derive(Default)]
    struct PanickingOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChangeEventHandler for PanickingOnce {
        async fn handle(&self, _event: ChangeEvent) -> Result<u64, ApplyError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler crashed");
            }
            Ok(1)
        }
    }

    fn supervisor(
        broker: &InMemoryBroker,
        handler: Arc<dyn ChangeEventHandler>,
    ) -> ConsumerSupervisor<InMemoryBroker> {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
        let manager = TopologyManager::new(
            Arc::new(broker.clone()),
            Topology::new("user_order", "orders").unwrap(),
            backoff,
        );
        let config = ConsumerConfig {
            requeue_delay: Duration::from_millis(1),
            ..ConsumerConfig::default()
        };
        ConsumerSupervisor::new(Dispatcher::new(manager, handler, config), backoff)
    }

    #[tokio::test]
    async fn test_restarts_after_panic_and_redelivers() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(PanickingOnce::default());
        let supervisor = supervisor(&broker, handler.clone());
        let manager = TopologyManager::new(
            Arc::new(broker.clone()),
            Topology::new("user_order", "orders").unwrap(),
            Backoff::default(),
        );
        manager.ensure_topology().await.unwrap();
        let payload = ChangeEvent::new("u-1", Some(vec!["a@x.io".into()]), None)
            .to_bytes()
            .unwrap();
        broker
            .publish_raw("user_order", OutboundMessage::new("orders", payload))
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = supervisor.spawn(rx);
        for _ in 0..500 {
            if handler.calls.load(Ordering::SeqCst) >= 2 && broker.queue_depth("orders") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.queue_depth("orders"), 0);

        tx.send(true).unwrap();
        assert!(matches!(
            handle.join(Duration::from_secs(1)).await,
            Some(SupervisorExit::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_ends_supervision() {
        let broker = InMemoryBroker::new();
        broker.set_misconfigured(Some("ACCESS_REFUSED".into()));
        let supervisor = supervisor(&broker, Arc::new(PanickingOnce::default()));
        let (_tx, rx) = watch::channel(false);
        let handle = supervisor.spawn(rx);
        assert!(matches!(
            handle.join(Duration::from_secs(1)).await,
            Some(SupervisorExit::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_while_broker_is_down() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(u32::MAX);
        let supervisor = supervisor(&broker, Arc::new(PanickingOnce::default()));
        let (tx, rx) = watch::channel(false);
        let handle = supervisor.spawn(rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(matches!(
            handle.join(Duration::from_secs(1)).await,
            Some(SupervisorExit::Shutdown)
        ));
    }
}
