//! Change event publishing.
//!
//! Two strategies share the [`EventPublisher`] contract:
//!
//! - [`PerCallPublisher`] opens a session per event, declares the topology,
//!   publishes and closes. Simple and stateless, one round trip heavier.
//! - [`PooledPublisher`] keeps one declared session and replaces it when it
//!   goes stale, retrying the event once on the fresh session.
//!
//! Both wait for the broker's publisher confirm and give up after a bounded
//! timeout, so a caller is never blocked indefinitely by an unreachable broker.

use crate::broker::{
    BrokerConnector, BrokerError, BrokerSession, Headers, PublishHandle, TopologyManager,
};
use async_trait::async_trait;
use csync_sdk::objects::{ChangeEvent, DeliveryAddress};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode change event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish did not complete within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event, returning once the broker has confirmed it.
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError>;

    /// Build and publish an event for `entity_id` with the given changed fields.
    async fn publish_change(
        &self,
        entity_id: &str,
        emails: Option<Vec<String>>,
        delivery_address: Option<DeliveryAddress>,
    ) -> Result<(), PublishError> {
        let event = ChangeEvent::new(entity_id, emails, delivery_address);
        self.publish(&event).await
    }

    /// Release any held broker resources.
    async fn close(&self) {}
}

pub struct PerCallPublisher<C: BrokerConnector> {
    topology: TopologyManager<C>,
    timeout: Duration,
}

impl<C: BrokerConnector> PerCallPublisher<C> {
    pub fn new(topology: TopologyManager<C>, timeout: Duration) -> Self {
        Self { topology, timeout }
    }
}

#[async_trait]
impl<C: BrokerConnector> EventPublisher for PerCallPublisher<C> {
    #[tracing::instrument(skip_all, err, fields(entity_id = %event.entity_id))]
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        let payload = event.to_bytes()?;
        let deadline = Instant::now() + self.timeout;

        let handles = timeout_at(deadline, self.topology.ensure_topology())
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))??;
        let published = timeout_at(deadline, handles.publish.publish(payload, Headers::new())).await;
        close_quietly(&handles.publish, self.timeout).await;
        published.map_err(|_| PublishError::Timeout(self.timeout))??;

        info!(
            queue = %self.topology.topology().queue(),
            "Published change event"
        );
        Ok(())
    }
}

pub struct PooledPublisher<C: BrokerConnector> {
    topology: TopologyManager<C>,
    timeout: Duration,
    handle: Mutex<Option<PublishHandle<C::Session>>>,
}

impl<C: BrokerConnector> PooledPublisher<C> {
    pub fn new(topology: TopologyManager<C>, timeout: Duration) -> Self {
        Self {
            topology,
            timeout,
            handle: Mutex::new(None),
        }
    }

    /// Open the long-lived session before the first publish, retrying
    /// transient failures. Returns `false` if shutdown interrupted it.
    pub async fn connect(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<bool, BrokerError> {
        match self.topology.ensure_topology_with_retry(shutdown_rx).await? {
            Some(handles) => {
                *self.handle.lock().await = Some(handles.publish);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every session that is not kept in the slot is closed before returning.
    async fn publish_pooled(&self, payload: Vec<u8>, deadline: Instant) -> Result<(), PublishError> {
        let timed_out = |_| PublishError::Timeout(self.timeout);
        let mut slot = timeout_at(deadline, self.handle.lock()).await.map_err(timed_out)?;

        if let Some(handle) = slot.as_ref() {
            if handle.is_open() {
                match timeout_at(deadline, handle.publish(payload.clone(), Headers::new())).await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
                    Ok(Err(e)) => warn!(error = %e, "Publish session failed, reconnecting"),
                    Err(_) => warn!("Publish session did not confirm in time, reconnecting"),
                }
            }
            if let Some(stale) = slot.take() {
                close_quietly(&stale, self.timeout).await;
            }
        }

        let handles = timeout_at(deadline, self.topology.ensure_topology())
            .await
            .map_err(timed_out)??;
        match timeout_at(deadline, handles.publish.publish(payload, Headers::new())).await {
            Ok(Ok(())) => {
                *slot = Some(handles.publish);
                Ok(())
            }
            Ok(Err(e)) => {
                close_quietly(&handles.publish, self.timeout).await;
                Err(e.into())
            }
            Err(_) => {
                close_quietly(&handles.publish, self.timeout).await;
                Err(PublishError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<C: BrokerConnector> EventPublisher for PooledPublisher<C> {
    #[tracing::instrument(skip_all, err, fields(entity_id = %event.entity_id))]
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        let payload = event.to_bytes()?;
        self.publish_pooled(payload, Instant::now() + self.timeout)
            .await?;
        info!(
            queue = %self.topology.topology().queue(),
            "Published change event"
        );
        Ok(())
    }

    async fn close(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            close_quietly(&handle, self.timeout).await;
        }
    }
}

async fn close_quietly<S: BrokerSession>(handle: &PublishHandle<S>, limit: Duration) {
    match tokio::time::timeout(limit, handle.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Failed to close publish session"),
        Err(_) => debug!("Closing publish session timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::utils::Backoff;
    use csync_sdk::config::Topology;
    use std::sync::Arc;

    fn topology(broker: &InMemoryBroker) -> TopologyManager<InMemoryBroker> {
        TopologyManager::new(
            Arc::new(broker.clone()),
            Topology::new("user_order", "orders").unwrap(),
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn event() -> ChangeEvent {
        ChangeEvent::new("u-1", Some(vec!["a@x.io".into()]), None)
    }

    #[tokio::test]
    async fn test_per_call_declares_publishes_and_closes() {
        let broker = InMemoryBroker::new();
        let publisher = PerCallPublisher::new(topology(&broker), Duration::from_secs(1));

        publisher.publish(&event()).await.unwrap();

        let queued = broker.peek("orders");
        assert_eq!(queued.len(), 1);
        assert_eq!(ChangeEvent::from_slice(&queued[0].0).unwrap(), event());
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_per_call_surfaces_unreachable_broker() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(1);
        let publisher = PerCallPublisher::new(topology(&broker), Duration::from_secs(1));
        assert!(matches!(
            publisher.publish(&event()).await,
            Err(PublishError::Broker(BrokerError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn test_pooled_reuses_one_session() {
        let broker = InMemoryBroker::new();
        let publisher = PooledPublisher::new(topology(&broker), Duration::from_secs(1));
        for _ in 0..3 {
            publisher.publish(&event()).await.unwrap();
        }
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.queue_depth("orders"), 3);

        publisher.close().await;
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_pooled_connect_ahead_of_first_publish() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(2);
        let publisher = PooledPublisher::new(topology(&broker), Duration::from_secs(1));
        let (_tx, mut rx) = watch::channel(false);
        assert!(publisher.connect(&mut rx).await.unwrap());
        assert_eq!(broker.open_sessions(), 1);

        publisher.publish(&event()).await.unwrap();
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_pooled_replaces_severed_session() {
        let broker = InMemoryBroker::new();
        let publisher = PooledPublisher::new(topology(&broker), Duration::from_secs(1));
        publisher.publish(&event()).await.unwrap();

        broker.sever_connections();
        publisher
            .publish_change("u-1", None, Some(DeliveryAddress::new("2 Oak", "X", "Y", "1", "US")))
            .await
            .unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.queue_depth("orders"), 2);
    }

    #[tokio::test]
    async fn test_per_call_closes_session_when_publish_fails() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);
        let publisher = PerCallPublisher::new(topology(&broker), Duration::from_secs(1));

        assert!(matches!(
            publisher.publish(&event()).await,
            Err(PublishError::Broker(BrokerError::Publish { .. }))
        ));
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_pooled_closes_every_failed_session() {
        let broker = InMemoryBroker::new();
        let publisher = PooledPublisher::new(topology(&broker), Duration::from_secs(1));
        publisher.publish(&event()).await.unwrap();

        // The cached session fails, then so does its replacement.
        broker.fail_next_publishes(2);
        assert!(matches!(
            publisher.publish(&event()).await,
            Err(PublishError::Broker(BrokerError::Publish { .. }))
        ));
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.closed_sessions(), 2);

        publisher.publish(&event()).await.unwrap();
        assert_eq!(broker.open_sessions(), 1);
        assert_eq!(broker.queue_depth("orders"), 2);
    }
}
