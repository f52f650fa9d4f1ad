//! A broker that lives inside the process.
//!
//! Follows the AMQP semantics the pipeline depends on: durable direct
//! routing, per-session unacknowledged deliveries that return to the head
//! of their queue (flagged as redelivered) when the session ends, and a
//! prefetch limit per subscription. Test hooks can refuse connections or
//! sever every open session.

use super::{
    BrokerConnector, BrokerError, BrokerSession, DeliveryStream, Headers, InboundDelivery,
    OutboundMessage,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    headers: Headers,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// delivery tag -> (session id, message)
    unacked: BTreeMap<u64, (u64, StoredMessage)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    /// (exchange, routing key) -> bound queues
    bindings: HashMap<(String, String), BTreeSet<String>>,
    queues: HashMap<String, QueueState>,
    open_sessions: HashSet<u64>,
    severed_sessions: HashSet<u64>,
    next_session: u64,
    next_tag: u64,
    connect_attempts: u64,
    refuse_connections: u32,
    fail_publishes: u32,
    explicit_closes: u64,
    misconfigured: Option<String>,
}

impl BrokerState {
    /// Return every unacknowledged delivery of `session` to the head of its
    /// queue, preserving delivery order.
    fn release_session(&mut self, session: u64) {
        for queue in self.queues.values_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == session)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
    }

    fn route(&mut self, exchange: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        if !self.exchanges.contains(exchange) {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let key = (exchange.to_string(), message.routing_key.clone());
        let targets: Vec<String> = self
            .bindings
            .get(&key)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();
        // Unroutable messages are dropped, as with a non-mandatory publish.
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(StoredMessage {
                    payload: message.payload.clone(),
                    headers: message.headers.clone(),
                    redelivered: false,
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.inner.notify.notify_waiters();
    }

    /// Fail the next `n` connection attempts as if the broker were down.
    pub fn refuse_next_connections(&self, n: u32) {
        self.lock().refuse_connections = n;
    }

    /// Fail the next `n` session publishes with a transient error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().fail_publishes = n;
    }

    /// Reject every connection with a non-transient error while set.
    pub fn set_misconfigured(&self, reason: Option<String>) {
        self.lock().misconfigured = reason;
    }

    /// Drop every open session from the broker side.
    pub fn sever_connections(&self) {
        {
            let mut state = self.lock();
            let sessions: Vec<u64> = state.open_sessions.drain().collect();
            for session in sessions {
                state.release_session(session);
                state.severed_sessions.insert(session);
            }
        }
        self.wake();
    }

    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions.len()
    }

    /// Sessions ended through `close()` rather than by being dropped.
    pub fn closed_sessions(&self) -> u64 {
        self.lock().explicit_closes
    }

    /// Ready plus unacknowledged messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Payloads and headers of the ready messages in `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<(Vec<u8>, Headers)> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| (m.payload.clone(), m.headers.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_bound(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.lock()
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .is_some_and(|queues| queues.contains(queue))
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.values().map(BTreeSet::len).sum()
    }

    /// Publish without a session, e.g. to inject a malformed payload.
    pub fn publish_raw(&self, exchange: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let result = self.lock().route(exchange, message);
        self.wake();
        result
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    type Session = InMemorySession;

    async fn connect(&self) -> Result<InMemorySession, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if let Some(reason) = &state.misconfigured {
            return Err(BrokerError::Configuration(reason.clone()));
        }
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        state.next_session += 1;
        let id = state.next_session;
        state.open_sessions.insert(id);
        Ok(InMemorySession {
            broker: self.clone(),
            id,
        })
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

pub struct InMemorySession {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemorySession {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.broker.lock();
        if state.open_sessions.contains(&self.id) {
            Ok(state)
        } else {
            Err(BrokerError::Closed(format!("session {} is closed", self.id)))
        }
    }

    fn shutdown(&self) {
        let released = {
            let mut state = self.broker.lock();
            if state.open_sessions.remove(&self.id) {
                state.release_session(self.id);
                true
            } else {
                false
            }
        };
        if released {
            self.broker.wake();
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    type Deliveries = InMemoryDeliveries;

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.open_state()?.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.open_state()?
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Topology {
                name: exchange.to_string(),
                reason: "NOT_FOUND - no such exchange".to_string(),
            });
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Topology {
                name: queue.to_string(),
                reason: "NOT_FOUND - no such queue".to_string(),
            });
        }
        state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let routing_key = message.routing_key.clone();
        {
            let mut state = self.open_state()?;
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BrokerError::Publish {
                    routing_key,
                    reason: "injected failure".to_string(),
                });
            }
            state
                .route(exchange, message)
                .map_err(|e| BrokerError::Publish {
                    routing_key,
                    reason: e.to_string(),
                })?;
        }
        self.broker.wake();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<InMemoryDeliveries, BrokerError> {
        let state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
        }
        Ok(InMemoryDeliveries {
            broker: self.broker.clone(),
            session: self.id,
            queue: queue.to_string(),
            prefetch: usize::from(prefetch.max(1)),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        let id = self.id;
        let owned = state.queues.values_mut().find_map(|q| {
            let mine = matches!(q.unacked.get(&delivery_tag), Some((owner, _)) if *owner == id);
            if mine {
                q.unacked.remove(&delivery_tag)
            } else {
                None
            }
        });
        match owned {
            Some(_) => Ok(()),
            None => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.open_state()?;
            let id = self.id;
            let mut found = false;
            for queue in state.queues.values_mut() {
                let owned = matches!(queue.unacked.get(&delivery_tag), Some((owner, _)) if *owner == id);
                if !owned {
                    continue;
                }
                if let Some((_, mut message)) = queue.unacked.remove(&delivery_tag) {
                    if requeue {
                        message.redelivered = true;
                        queue.ready.push_front(message);
                    }
                    found = true;
                }
                break;
            }
            if !found {
                return Err(BrokerError::Channel(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )));
            }
        }
        self.broker.wake();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            if state.open_sessions.contains(&self.id) {
                state.explicit_closes += 1;
            }
        }
        self.shutdown();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().open_sessions.contains(&self.id)
    }
}

pub struct InMemoryDeliveries {
    broker: InMemoryBroker,
    session: u64,
    queue: String,
    prefetch: usize,
}

impl InMemoryDeliveries {
    /// `None` while nothing can be delivered yet.
    fn poll_once(&self) -> Option<Option<Result<InboundDelivery, BrokerError>>> {
        let mut guard = self.broker.lock();
        let state: &mut BrokerState = &mut guard;
        if !state.open_sessions.contains(&self.session) {
            if state.severed_sessions.contains(&self.session) {
                return Some(Some(Err(BrokerError::Closed(
                    "connection severed by broker".to_string(),
                ))));
            }
            return Some(None);
        }
        let session = self.session;
        let queue = state.queues.get_mut(&self.queue)?;
        let in_flight = queue
            .unacked
            .values()
            .filter(|(owner, _)| *owner == session)
            .count();
        if in_flight >= self.prefetch {
            return None;
        }
        let message = queue.ready.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        queue.unacked.insert(tag, (session, message.clone()));
        Some(Some(Ok(InboundDelivery {
            delivery_tag: tag,
            payload: message.payload,
            redelivered: message.redelivered,
            headers: message.headers,
        })))
    }
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveries {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, BrokerError>> {
        loop {
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(next) = self.poll_once() {
                return next;
            }
            notified.await;
        }
    }
}
