//! Idempotent declaration of the exchange, queue and binding.
//!
//! Both the publisher and the consumer go through [`TopologyManager`], so
//! whichever side starts first creates the topology and the other side's
//! declaration is a no-op.

use super::{
    BrokerConnector, BrokerError, BrokerSession, Headers, OutboundMessage,
};
use crate::utils::{Backoff, sleep_or_shutdown};
use csync_sdk::config::Topology;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct TopologyManager<C: BrokerConnector> {
    connector: Arc<C>,
    topology: Topology,
    backoff: Backoff,
}

impl<C: BrokerConnector> Clone for TopologyManager<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            topology: self.topology.clone(),
            backoff: self.backoff,
        }
    }
}

impl<C: BrokerConnector> TopologyManager<C> {
    pub fn new(connector: Arc<C>, topology: Topology, backoff: Backoff) -> Self {
        Self {
            connector,
            topology,
            backoff,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Declare everything on an open session. Safe to repeat.
    pub async fn declare(session: &C::Session, topology: &Topology) -> Result<(), BrokerError> {
        session.declare_exchange(topology.exchange()).await?;
        session.declare_queue(topology.queue()).await?;
        session
            .bind_queue(topology.queue(), topology.exchange(), topology.routing_key())
            .await?;
        if let Some(policy) = topology.dead_letter() {
            session.declare_queue(&policy.queue).await?;
            session
                .bind_queue(&policy.queue, topology.exchange(), &policy.queue)
                .await?;
        }
        debug!(
            exchange = %topology.exchange(),
            queue = %topology.queue(),
            "Topology declared"
        );
        Ok(())
    }

    /// One attempt: connect and declare.
    pub async fn ensure_topology(&self) -> Result<TopologyHandles<C::Session>, BrokerError> {
        let session = self.connector.connect().await?;
        if let Err(e) = Self::declare(&session, &self.topology).await {
            if let Err(close_err) = session.close().await {
                debug!(error = %close_err, "Failed to close session after declare error");
            }
            return Err(e);
        }
        Ok(TopologyHandles::new(Arc::new(session), self.topology.clone()))
    }

    /// Connect and declare, retrying transient failures with backoff.
    ///
    /// Returns `Ok(None)` if shutdown is signaled while waiting, and the
    /// error itself if it is not transient.
    pub async fn ensure_topology_with_retry(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Option<TopologyHandles<C::Session>>, BrokerError> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown_rx.borrow() {
                return Ok(None);
            }
            match self.ensure_topology().await {
                Ok(handles) => {
                    if attempt > 0 {
                        info!(
                            broker = %self.connector.describe(),
                            attempts = attempt + 1,
                            "Broker reachable again"
                        );
                    }
                    return Ok(Some(handles));
                }
                Err(e) if !e.is_transient() => {
                    error!(broker = %self.connector.describe(), error = %e, "Broker rejected topology");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        broker = %self.connector.describe(),
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Broker unavailable, retrying"
                    );
                    attempt = attempt.saturating_add(1);
                    if sleep_or_shutdown(delay, shutdown_rx).await {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// The publish and consume sides of one declared session.
pub struct TopologyHandles<S> {
    pub publish: PublishHandle<S>,
    pub consume: ConsumeHandle<S>,
}

impl<S: BrokerSession> TopologyHandles<S> {
    fn new(session: Arc<S>, topology: Topology) -> Self {
        Self {
            publish: PublishHandle {
                session: session.clone(),
                topology: topology.clone(),
            },
            consume: ConsumeHandle { session, topology },
        }
    }
}

pub struct PublishHandle<S> {
    session: Arc<S>,
    topology: Topology,
}

impl<S: BrokerSession> PublishHandle<S> {
    /// Publish to the work queue's routing key.
    pub async fn publish(&self, payload: Vec<u8>, headers: Headers) -> Result<(), BrokerError> {
        let routing_key = self.topology.routing_key().to_string();
        self.publish_to(&routing_key, payload, headers).await
    }

    /// Publish on the exchange with an explicit routing key.
    pub async fn publish_to(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        let message = OutboundMessage {
            routing_key: routing_key.to_string(),
            payload,
            headers,
        };
        self.session.publish(self.topology.exchange(), message).await
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.session.close().await
    }
}

pub struct ConsumeHandle<S> {
    session: Arc<S>,
    topology: Topology,
}

impl<S: BrokerSession> ConsumeHandle<S> {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn subscribe(&self, prefetch: u16) -> Result<S::Deliveries, BrokerError> {
        self.session.consume(self.topology.queue(), prefetch).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.session.ack(delivery_tag).await
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.session.nack(delivery_tag, requeue).await
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use csync_sdk::config::DeadLetterPolicy;
    use std::time::Duration;

    fn manager(broker: &InMemoryBroker, topology: Topology) -> TopologyManager<InMemoryBroker> {
        TopologyManager::new(
            Arc::new(broker.clone()),
            topology,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_declaration_is_idempotent() {
        let broker = InMemoryBroker::new();
        let topology = Topology::new("user_order", "orders").unwrap();
        let manager = manager(&broker, topology);

        let first = manager.ensure_topology().await.unwrap();
        let second = manager.ensure_topology().await.unwrap();
        assert!(broker.is_bound("user_order", "orders", "orders"));
        assert_eq!(broker.binding_count(), 1);

        second
            .publish
            .publish(b"{}".to_vec(), Headers::new())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("orders"), 1);
        first.publish.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_queue_is_declared() {
        let broker = InMemoryBroker::new();
        let topology = Topology::new("user_order", "orders")
            .unwrap()
            .with_dead_letter(DeadLetterPolicy {
                queue: "orders.dead".into(),
                max_attempts: 3,
            })
            .unwrap();
        manager(&broker, topology).ensure_topology().await.unwrap();
        assert!(broker.is_bound("user_order", "orders.dead", "orders.dead"));
    }

    #[tokio::test]
    async fn test_retry_until_broker_accepts() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(3);
        let manager = manager(&broker, Topology::new("user_order", "orders").unwrap());
        let (_tx, mut rx) = watch::channel(false);

        let handles = manager.ensure_topology_with_retry(&mut rx).await.unwrap();
        assert!(handles.is_some());
        assert_eq!(broker.connect_attempts(), 4);
    }

    #[tokio::test]
    async fn test_configuration_error_is_not_retried() {
        let broker = InMemoryBroker::new();
        broker.set_misconfigured(Some("ACCESS_REFUSED - login refused".into()));
        let manager = manager(&broker, Topology::new("user_order", "orders").unwrap());
        let (_tx, mut rx) = watch::channel(false);

        let err = manager
            .ensure_topology_with_retry(&mut rx)
            .await
            .err()
            .unwrap();
        assert!(!err.is_transient());
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(u32::MAX);
        let manager = TopologyManager::new(
            Arc::new(broker.clone()),
            Topology::new("user_order", "orders").unwrap(),
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
        );
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move { manager.ensure_topology_with_retry(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(task.await.unwrap().unwrap().is_none());
    }
}
