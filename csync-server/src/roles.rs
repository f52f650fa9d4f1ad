//! Startup and shutdown of the background parts of each role.

use crate::config::{LoadedConfig, Role};
use crate::state::AppState;
use csync_core::broker::{AmqpConnector, BrokerError, TopologyManager};
use csync_core::events::ShutdownReceiver;
use csync_core::framework::DatabaseProcessor;
use csync_core::processors::{
    ConsumerSupervisor, Dispatcher, EventPublisher, PerCallPublisher, PooledPublisher,
    PropagationApplier, SupervisorExit, SupervisorHandle, UserContactWriter,
};
use csync_core::utils::Backoff;
use csync_sdk::config::PublisherMode;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on the random part of every reconnect delay.
const RECONNECT_JITTER: Duration = Duration::from_millis(250);

/// Background work owned by a running role.
pub struct RunningRole {
    pub state: AppState,
    supervisor: Option<SupervisorHandle>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl RunningRole {
    /// Stop the consumer and release broker connections.
    ///
    /// The shutdown signal must already be sent.
    pub async fn shutdown(self, grace: Duration) {
        if let Some(supervisor) = self.supervisor {
            tracing::info!("Waiting for consumer to finish in-flight work...");
            match supervisor.join(grace).await {
                Some(SupervisorExit::Shutdown) => tracing::info!("Consumer stopped"),
                Some(SupervisorExit::Failed(e)) => {
                    tracing::error!(error = %e, "Consumer had already stopped")
                }
                None => tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Consumer did not stop within the grace period, aborted"
                ),
            }
        }
        if let Some(publisher) = self.publisher {
            publisher.close().await;
        }
    }
}

fn topology_manager(config: &LoadedConfig) -> Result<TopologyManager<AmqpConnector>, BrokerError> {
    let connector = AmqpConnector::new(config.broker.clone())?;
    let backoff = Backoff::new(config.consumer.reconnect_initial, config.consumer.reconnect_max)
        .with_jitter(RECONNECT_JITTER);
    Ok(TopologyManager::new(
        Arc::new(connector),
        config.topology.clone(),
        backoff,
    ))
}

/// Declare the topology once before anything is served.
///
/// Returns `false` if shutdown was requested while the broker was unreachable.
async fn establish_topology(
    manager: &TopologyManager<AmqpConnector>,
    shutdown_rx: &mut ShutdownReceiver,
) -> Result<bool, BrokerError> {
    tracing::info!(broker = %manager.describe(), "Declaring broker topology...");
    let Some(handles) = manager.ensure_topology_with_retry(shutdown_rx).await? else {
        return Ok(false);
    };
    if let Err(e) = handles.publish.close().await {
        tracing::debug!(error = %e, "Failed to close setup session");
    }
    tracing::info!(
        exchange = %manager.topology().exchange(),
        queue = %manager.topology().queue(),
        "Broker topology declared"
    );
    Ok(true)
}

/// Start the given role. Returns `None` if shutdown was requested first.
pub async fn start(
    role: Role,
    config: &LoadedConfig,
    db: DatabaseProcessor,
    shutdown_rx: ShutdownReceiver,
) -> anyhow::Result<Option<RunningRole>> {
    match role {
        Role::OrderService => start_order_service(config, db, shutdown_rx).await,
        Role::UserService => start_user_service(config, db, shutdown_rx).await,
    }
}

async fn start_order_service(
    config: &LoadedConfig,
    db: DatabaseProcessor,
    mut shutdown_rx: ShutdownReceiver,
) -> anyhow::Result<Option<RunningRole>> {
    let manager = topology_manager(config)?;
    if !establish_topology(&manager, &mut shutdown_rx).await? {
        return Ok(None);
    }

    let restart_backoff = *manager.backoff();
    let applier = Arc::new(PropagationApplier::new(Arc::new(db.clone())));
    let dispatcher = Dispatcher::new(manager, applier, config.consumer.clone());
    let consumer_state = dispatcher.state();
    let supervisor = ConsumerSupervisor::new(dispatcher, restart_backoff).spawn(shutdown_rx);

    Ok(Some(RunningRole {
        state: AppState::order_service(Arc::new(db), consumer_state),
        supervisor: Some(supervisor),
        publisher: None,
    }))
}

async fn start_user_service(
    config: &LoadedConfig,
    db: DatabaseProcessor,
    mut shutdown_rx: ShutdownReceiver,
) -> anyhow::Result<Option<RunningRole>> {
    let manager = topology_manager(config)?;
    let timeout = config.publisher.timeout;

    let publisher: Arc<dyn EventPublisher> = match config.publisher.mode {
        PublisherMode::Pooled => {
            let publisher = PooledPublisher::new(manager, timeout);
            if !publisher.connect(&mut shutdown_rx).await? {
                return Ok(None);
            }
            Arc::new(publisher)
        }
        PublisherMode::PerCall => {
            if !establish_topology(&manager, &mut shutdown_rx).await? {
                return Ok(None);
            }
            Arc::new(PerCallPublisher::new(manager, timeout))
        }
    };
    tracing::info!(mode = ?config.publisher.mode, "Change event publisher ready");

    let writer = UserContactWriter::new(Arc::new(db), publisher.clone());
    Ok(Some(RunningRole {
        state: AppState::user_service(Arc::new(writer)),
        supervisor: None,
        publisher: Some(publisher),
    }))
}
