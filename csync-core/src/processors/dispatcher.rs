//! Dispatcher processor.
//!
//! The Dispatcher is responsible for:
//! - Connecting to the broker and declaring the topology, with backoff
//! - Subscribing to the work queue and handling deliveries one at a time
//! - Acknowledging only after the handler succeeded (at-least-once)
//! - Dropping undecodable or invalid events, so they cannot block the queue
//! - Requeueing or dead-lettering events whose handling failed
//! - Reconnecting after the connection is lost
//! - Publishing its lifecycle on a [`ConsumerState`] watch channel
//!
//! A delivery that has started is always settled before shutdown is
//! honored; the shutdown signal is only observed between deliveries.

use crate::broker::{
    ATTEMPT_HEADER, BrokerConnector, BrokerError, DeliveryStream, FAILURE_HEADER, Headers,
    InboundDelivery, TopologyHandles, TopologyManager,
};
use crate::events::{ConsumerState, ConsumerStateReceiver, ConsumerStateSender, DeliveryOutcome};
use crate::processors::applier::{ApplyError, ChangeEventHandler};
use csync_sdk::config::ConsumerConfig;
use csync_sdk::objects::ChangeEvent;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The broker refused the connection or topology for a reason that
    /// retrying cannot fix.
    #[error("consumer cannot start: {0}")]
    Broker(#[source] BrokerError),
}

enum LoopExit {
    Shutdown,
    ConnectionLost(BrokerError),
}

pub struct Dispatcher<C: BrokerConnector> {
    topology: TopologyManager<C>,
    handler: Arc<dyn ChangeEventHandler>,
    config: ConsumerConfig,
    state_tx: Arc<ConsumerStateSender>,
}

impl<C: BrokerConnector> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            topology: self.topology.clone(),
            handler: self.handler.clone(),
            config: self.config.clone(),
            state_tx: self.state_tx.clone(),
        }
    }
}

impl<C: BrokerConnector> Dispatcher<C> {
    pub fn new(
        topology: TopologyManager<C>,
        handler: Arc<dyn ChangeEventHandler>,
        config: ConsumerConfig,
    ) -> Self {
        let (state_tx, _) = crate::events::consumer_state_channel();
        Self {
            topology,
            handler,
            config,
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn state(&self) -> ConsumerStateReceiver {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConsumerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Consumer state changed");
        }
    }

    /// Run until shutdown is signaled or the broker rejects the setup for good.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), DispatchError> {
        info!(
            broker = %self.topology.describe(),
            queue = %self.topology.topology().queue(),
            "Dispatcher started"
        );
        let mut lost: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(ConsumerState::Connecting);

            let handles = match self.topology.ensure_topology_with_retry(&mut shutdown_rx).await {
                Ok(Some(handles)) => handles,
                Ok(None) => break,
                Err(e) => {
                    self.set_state(ConsumerState::Stopped);
                    return Err(DispatchError::Broker(e));
                }
            };

            let exit = match handles.consume.subscribe(self.config.prefetch).await {
                Ok(mut deliveries) => {
                    self.set_state(ConsumerState::Subscribed);
                    info!(
                        queue = %self.topology.topology().queue(),
                        prefetch = self.config.prefetch,
                        "Subscribed to work queue"
                    );
                    lost = 0;
                    self.consume(&handles, &mut deliveries, &mut shutdown_rx).await
                }
                Err(e) => LoopExit::ConnectionLost(e),
            };

            if let Err(e) = handles.consume.close().await {
                debug!(error = %e, "Failed to close consumer session");
            }

            match exit {
                LoopExit::Shutdown => break,
                LoopExit::ConnectionLost(e) if !e.is_transient() => {
                    error!(error = %e, "Broker rejected the subscription");
                    self.set_state(ConsumerState::Stopped);
                    return Err(DispatchError::Broker(e));
                }
                LoopExit::ConnectionLost(e) => {
                    self.set_state(ConsumerState::Connecting);
                    let delay = self.topology.backoff().delay(lost);
                    lost = lost.saturating_add(1);
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Lost broker connection, reconnecting"
                    );
                    if crate::utils::sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!("Dispatcher shutdown complete");
        Ok(())
    }

    async fn consume(
        &self,
        handles: &TopologyHandles<C::Session>,
        deliveries: &mut <C::Session as crate::broker::BrokerSession>::Deliveries,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Dispatcher received shutdown signal");
                        return LoopExit::Shutdown;
                    }
                }

                next = deliveries.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = self.handle_delivery(handles, delivery).await {
                            return LoopExit::ConnectionLost(e);
                        }
                    }
                    Some(Err(e)) => return LoopExit::ConnectionLost(e),
                    None => {
                        return LoopExit::ConnectionLost(BrokerError::Closed(
                            "subscription ended".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Decode, apply and settle one delivery.
    ///
    /// Errors only when the broker could not be told how the delivery was
    /// settled; the delivery then returns to the queue with the session.
    #[tracing::instrument(skip_all, fields(delivery_tag = delivery.delivery_tag, redelivered = delivery.redelivered))]
    pub(crate) async fn handle_delivery(
        &self,
        handles: &TopologyHandles<C::Session>,
        delivery: InboundDelivery,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let event = match ChangeEvent::from_slice(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable delivery");
                return self.drop_delivery(handles, &delivery, &e.to_string()).await;
            }
        };

        let entity_id = event.entity_id.clone();
        match self.handler.handle(event.clone()).await {
            Ok(updated) => {
                handles.consume.ack(delivery.delivery_tag).await?;
                debug!(%entity_id, updated, "Delivery acknowledged");
                Ok(DeliveryOutcome::Applied { updated })
            }
            Err(e) if !e.is_retryable() => {
                warn!(%entity_id, error = %e, "Dropping invalid change event");
                self.drop_delivery(handles, &delivery, &e.to_string()).await
            }
            Err(e) => self.retry(handles, delivery, event, e).await,
        }
    }

    /// Settle a failed delivery without losing its place at the head of the
    /// queue.
    ///
    /// Without a dead-letter queue the delivery is handed back to the broker
    /// after a pause. With one, the delivery stays unacknowledged while it is
    /// retried here, and is dead-lettered once `max_attempts` is reached.
    async fn retry(
        &self,
        handles: &TopologyHandles<C::Session>,
        delivery: InboundDelivery,
        event: ChangeEvent,
        mut cause: ApplyError,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let entity_id = event.entity_id.clone();
        let mut attempt = delivery.attempt();
        let Some(policy) = handles.consume.topology().dead_letter().cloned() else {
            warn!(%entity_id, attempt, error = %cause, "Change event failed, requeueing");
            tokio::time::sleep(self.config.requeue_delay).await;
            handles.consume.nack(delivery.delivery_tag, true).await?;
            return Ok(DeliveryOutcome::Requeued);
        };

        while attempt < policy.max_attempts {
            warn!(
                %entity_id,
                attempt,
                max_attempts = policy.max_attempts,
                error = %cause,
                "Change event failed, retrying"
            );
            tokio::time::sleep(self.config.requeue_delay).await;
            attempt += 1;
            match self.handler.handle(event.clone()).await {
                Ok(updated) => {
                    handles.consume.ack(delivery.delivery_tag).await?;
                    info!(%entity_id, attempt, updated, "Change event applied after retry");
                    return Ok(DeliveryOutcome::Applied { updated });
                }
                Err(e) if !e.is_retryable() => {
                    warn!(%entity_id, error = %e, "Dropping invalid change event");
                    return self.drop_delivery(handles, &delivery, &e.to_string()).await;
                }
                Err(e) => cause = e,
            }
        }

        let mut headers = delivery.headers.clone();
        headers.insert(ATTEMPT_HEADER.to_string(), attempt.to_string());
        headers.insert(FAILURE_HEADER.to_string(), cause.to_string());
        match handles
            .publish
            .publish_to(&policy.queue, delivery.payload.clone(), headers)
            .await
        {
            Ok(()) => {
                error!(
                    %entity_id,
                    attempt,
                    error = %cause,
                    dead_letter_queue = %policy.queue,
                    "Change event exhausted its attempts, dead-lettered"
                );
                handles.consume.ack(delivery.delivery_tag).await?;
                Ok(DeliveryOutcome::DeadLettered)
            }
            Err(e) => {
                warn!(%entity_id, error = %e, "Dead-lettering failed, requeueing");
                handles.consume.nack(delivery.delivery_tag, true).await?;
                Ok(DeliveryOutcome::Requeued)
            }
        }
    }

    /// Acknowledge a delivery that can never succeed.
    async fn drop_delivery(
        &self,
        handles: &TopologyHandles<C::Session>,
        delivery: &InboundDelivery,
        reason: &str,
    ) -> Result<DeliveryOutcome, BrokerError> {
        self.copy_to_dead_letter(handles, delivery, reason).await;
        handles.consume.ack(delivery.delivery_tag).await?;
        Ok(DeliveryOutcome::Dropped)
    }

    /// Keep a copy of a dropped delivery when a dead-letter queue exists.
    async fn copy_to_dead_letter(
        &self,
        handles: &TopologyHandles<C::Session>,
        delivery: &InboundDelivery,
        reason: &str,
    ) {
        let Some(policy) = handles.consume.topology().dead_letter() else {
            return;
        };
        let mut headers: Headers = delivery.headers.clone();
        headers.insert(FAILURE_HEADER.to_string(), reason.to_string());
        if let Err(e) = handles
            .publish
            .publish_to(&policy.queue, delivery.payload.clone(), headers)
            .await
        {
            warn!(error = %e, "Failed to copy dropped delivery to dead-letter queue");
        }
    }
}
