//! In-memory message broker.
//!
//! [`InMemoryBroker`] plays the broker server: it owns exchanges, queues,
//! bindings and every message. [`BrokerConnector::connect`] hands out
//! [`InMemoryConnection`]s that implement the [`Broker`] port against that
//! shared state, with the same rules the AMQP adapter follows:
//!
//! - topic exchanges route by binding pattern, unroutable messages are dropped
//! - consumers see at most `prefetch` unacknowledged deliveries
//! - `nack(requeue = true)` puts the message back at the head of its queue,
//!   flagged as redelivered
//! - closing a connection requeues its unacknowledged deliveries
//!
//! Everything that crosses the port is recorded so tests can assert on
//! publishes, acks and nacks. Failures can be injected per operation.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stockbridge_core::broker::{
    Broker, BrokerConnector, BrokerError, BrokerFuture, Delivery, DeliveryStream, DeliveryTag,
    OutboundMessage,
};
use stockbridge_core::topology::{BindingSpec, ExchangeSpec, Topology, topic_matches};
use tokio::sync::Notify;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    connection: u64,
    consumer: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct Faults {
    failing_connects: usize,
    failing_declares: usize,
    publishes_fail: bool,
    acks_fail: bool,
}

#[derive(Debug, Default)]
struct State {
    exchanges: BTreeMap<String, ExchangeSpec>,
    queues: BTreeMap<String, VecDeque<StoredMessage>>,
    bindings: Vec<BindingSpec>,
    in_flight: BTreeMap<DeliveryTag, InFlight>,
    published: Vec<OutboundMessage>,
    acks: Vec<DeliveryTag>,
    nacks: Vec<(DeliveryTag, bool)>,
    next_tag: u64,
    connect_attempts: usize,
    close_calls: usize,
    faults: Faults,
}

impl State {
    fn route(&mut self, message: &OutboundMessage) -> Result<usize, BrokerError> {
        if !self.exchanges.contains_key(&message.exchange) {
            return Err(BrokerError::Publish {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                reason: "no such exchange".to_string(),
            });
        }

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange && topic_matches(&b.routing_key, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(ready) = self.queues.get_mut(queue) {
                ready.push_back(StoredMessage {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    payload: message.payload.clone(),
                    redelivered: false,
                });
            }
        }
        self.published.push(message.clone());
        Ok(targets.len())
    }

    fn in_flight_for(&self, consumer: u64) -> usize {
        self.in_flight.values().filter(|f| f.consumer == consumer).count()
    }
}

/// Broker server held in memory.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
    ids: Arc<AtomicU64>,
    connections: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker with `topology` already declared.
    #[must_use]
    pub fn with_topology(topology: &Topology) -> Self {
        let broker = Self::new();
        broker.declare(topology);
        broker
    }

    fn state(&self) -> MutexGuard<'_, State> {
        guard(&self.state)
    }

    fn declare(&self, topology: &Topology) {
        let mut state = self.state();
        for exchange in &topology.exchanges {
            state.exchanges.insert(exchange.name.clone(), exchange.clone());
        }
        for queue in &topology.queues {
            state.queues.entry(queue.name.clone()).or_default();
        }
        for binding in &topology.bindings {
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
        }
    }

    /// Publish from outside any connection, as another service would.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Publish`] if the exchange does not exist.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<usize, BrokerError> {
        let routed = self
            .state()
            .route(&OutboundMessage::json(exchange, routing_key, payload.into()))?;
        self.changed.notify_waiters();
        Ok(routed)
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.state().faults.failing_connects = n;
    }

    /// Fail the next `n` topology declarations.
    pub fn fail_next_declares(&self, n: usize) {
        self.state().faults.failing_declares = n;
    }

    /// Make every publish through a connection fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.state().faults.publishes_fail = fail;
    }

    /// Make every ack and nack fail.
    pub fn fail_acks(&self, fail: bool) {
        self.state().faults.acks_fail = fail;
    }

    /// Drop every open connection, as a broker restart would.
    pub fn disconnect_all(&self) {
        let connections: Vec<Arc<AtomicBool>> = guard(&self.connections).drain(..).collect();
        for open in connections {
            open.store(false, Ordering::SeqCst);
        }
        let mut state = self.state();
        let tags: Vec<DeliveryTag> = state.in_flight.keys().copied().collect();
        requeue(&mut state, &tags);
        drop(state);
        self.changed.notify_waiters();
    }

    /// Every message published through a connection or injected, in order.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state().published.clone()
    }

    /// Messages published to one exchange.
    #[must_use]
    pub fn published_to(&self, exchange: &str) -> Vec<OutboundMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Acknowledged delivery tags, in order.
    #[must_use]
    pub fn acks(&self) -> Vec<DeliveryTag> {
        self.state().acks.clone()
    }

    /// Negatively acknowledged delivery tags with their requeue flag.
    #[must_use]
    pub fn nacks(&self) -> Vec<(DeliveryTag, bool)> {
        self.state().nacks.clone()
    }

    /// Messages waiting in a queue.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries handed out and not yet settled.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Connection attempts so far, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    /// Number of `close` calls on connections.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Whether a queue is declared.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Wait until `queue` is empty and nothing is in flight.
    ///
    /// Returns `false` if that does not happen within `timeout`.
    pub async fn wait_until_drained(&self, queue: &str, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                {
                    let state = self.state();
                    let empty = state.queues.get(queue).is_none_or(VecDeque::is_empty);
                    if empty && state.in_flight.is_empty() {
                        return;
                    }
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }
}

fn requeue(state: &mut State, tags: &[DeliveryTag]) {
    // Walk backwards so the oldest delivery ends up first in line.
    for tag in tags.iter().rev() {
        if let Some(flight) = state.in_flight.remove(tag) {
            let mut message = flight.message;
            message.redelivered = true;
            if let Some(ready) = state.queues.get_mut(&flight.queue) {
                ready.push_front(message);
            }
        }
    }
}

impl BrokerConnector for InMemoryBroker {
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn Broker>> {
        Box::pin(async move {
            {
                let mut state = self.state();
                state.connect_attempts += 1;
                if state.faults.failing_connects > 0 {
                    state.faults.failing_connects -= 1;
                    return Err(BrokerError::Unavailable("connection refused".to_string()));
                }
            }

            let open = Arc::new(AtomicBool::new(true));
            guard(&self.connections).push(open.clone());
            let connection: Arc<dyn Broker> = Arc::new(InMemoryConnection {
                broker: self.clone(),
                id: self.ids.fetch_add(1, Ordering::SeqCst),
                open,
            });
            Ok(connection)
        })
    }

    fn endpoint(&self) -> String {
        "memory://broker".to_string()
    }
}

/// One connection (with its single channel) to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }

    fn settle(&self, tag: DeliveryTag, requeue_message: Option<bool>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if state.faults.acks_fail {
            return Err(BrokerError::Acknowledge {
                tag,
                reason: "injected failure".to_string(),
            });
        }
        let owned = state
            .in_flight
            .get(&tag)
            .is_some_and(|flight| flight.connection == self.id);
        if !owned {
            return Err(BrokerError::Acknowledge {
                tag,
                reason: "unknown delivery tag".to_string(),
            });
        }

        match requeue_message {
            None => {
                state.in_flight.remove(&tag);
                state.acks.push(tag);
            }
            Some(true) => {
                requeue(&mut state, &[tag]);
                state.nacks.push((tag, true));
            }
            Some(false) => {
                state.in_flight.remove(&tag);
                state.nacks.push((tag, false));
            }
        }
        drop(state);
        self.broker.changed.notify_waiters();
        Ok(())
    }
}

impl Broker for InMemoryConnection {
    fn declare_topology<'a>(&'a self, topology: &'a Topology) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            {
                let mut state = self.broker.state();
                if state.faults.failing_declares > 0 {
                    state.faults.failing_declares -= 1;
                    return Err(BrokerError::Topology {
                        name: topology
                            .exchanges
                            .first()
                            .map_or_else(String::new, |e| e.name.clone()),
                        reason: "injected failure".to_string(),
                    });
                }
            }
            self.broker.declare(topology);
            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str, prefetch: u16) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            self.ensure_open()?;
            if !self.broker.has_queue(queue) {
                return Err(BrokerError::Consume {
                    queue: queue.to_string(),
                    reason: "no such queue".to_string(),
                });
            }

            let broker = self.broker.clone();
            let open = self.open.clone();
            let connection = self.id;
            let consumer = broker.ids.fetch_add(1, Ordering::SeqCst);
            let queue = queue.to_string();
            let prefetch = usize::from(prefetch.max(1));

            let stream = async_stream::stream! {
                loop {
                    let changed = broker.changed.notified();
                    if !open.load(Ordering::SeqCst) {
                        break;
                    }

                    let next = {
                        let mut state = broker.state();
                        if state.in_flight_for(consumer) < prefetch {
                            let message = state.queues.get_mut(&queue).and_then(VecDeque::pop_front);
                            message.map(|message| {
                                state.next_tag += 1;
                                let tag = DeliveryTag(state.next_tag);
                                state.in_flight.insert(tag, InFlight {
                                    queue: queue.clone(),
                                    connection,
                                    consumer,
                                    message: message.clone(),
                                });
                                Delivery {
                                    tag,
                                    exchange: message.exchange,
                                    routing_key: message.routing_key,
                                    redelivered: message.redelivered,
                                    payload: message.payload,
                                }
                            })
                        } else {
                            None
                        }
                    };

                    match next {
                        Some(delivery) => yield Ok(delivery),
                        None => changed.await,
                    }
                }
            };

            let stream: DeliveryStream = Box::pin(stream);
            Ok(stream)
        })
    }

    fn publish(&self, message: OutboundMessage) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            {
                let mut state = self.broker.state();
                if state.faults.publishes_fail {
                    return Err(BrokerError::Publish {
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        reason: "injected failure".to_string(),
                    });
                }
                state.route(&message)?;
            }
            self.broker.changed.notify_waiters();
            Ok(())
        })
    }

    fn ack(&self, tag: DeliveryTag) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(tag, None) })
    }

    fn nack(&self, tag: DeliveryTag, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(tag, Some(requeue)) })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let was_open = self.open.swap(false, Ordering::SeqCst);
            {
                let mut state = self.broker.state();
                state.close_calls += 1;
                let tags: Vec<DeliveryTag> = state
                    .in_flight
                    .iter()
                    .filter(|(_, flight)| flight.connection == self.id)
                    .map(|(tag, _)| *tag)
                    .collect();
                requeue(&mut state, &tags);
            }
            self.broker.changed.notify_waiters();
            if was_open { Ok(()) } else { Err(BrokerError::Closed) }
        })
    }
}
