//! In-memory broker for testing and development
//!
//! Models the parts of an AMQP 0-9-1 broker the grade services rely on:
//! durable topic exchanges, exclusive server-named queues, wildcard
//! bindings, per-channel delivery tags and manual settlement.

use crate::envelope::{Delivery, ExchangeSpec, MessageEnvelope, MessageHeaders};
use crate::topic::topic_matches;
use crate::worker::Settlement;
use crate::{Broker, BrokerChannel, BusError, BusResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Number of published envelopes, settlements and dead letters kept for
/// inspection; older entries are dropped first
pub const DEFAULT_JOURNAL_CAPACITY: usize = 1000;

/// Broker "server" kept entirely in memory
///
/// Clones share the same state, so a test can hand one clone to a producer,
/// another to a worker, and inspect the result through a third. Closed
/// channels and connections are forgotten; the inspection journals are
/// bounded by [`DEFAULT_JOURNAL_CAPACITY`] unless configured otherwise.
///
/// # Example
/// ```rust
/// use amqp_bus::{Broker, ExchangeSpec, InMemoryBroker, MessageEnvelope};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let connection = broker.connect()?;
/// let channel = connection.open_channel().await?;
///
/// channel.declare_exchange(&ExchangeSpec::topic("grades_exchange")).await?;
/// let queue = channel.declare_exclusive_queue().await?;
/// channel.bind_queue(&queue, "grades_exchange", "grades.new.*").await?;
///
/// channel
///     .publish(MessageEnvelope::new("grades_exchange", "grades.new.math", b"{}".to_vec()))
///     .await?;
/// assert_eq!(broker.queue_depth(&queue), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Mutex<State>>,
}

/// One settlement call observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub channel_id: u64,
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub settlement: Settlement,
}

struct State {
    reachable: bool,
    next_id: u64,
    journal_capacity: usize,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: VecDeque<MessageEnvelope>,
    settlements: VecDeque<SettlementRecord>,
    dead_letters: VecDeque<Delivery>,
}

struct ChannelState {
    connection_id: u64,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
    consuming: Vec<String>,
}

struct QueueState {
    owner_connection: u64,
    ready: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    binding_key: String,
}

#[derive(Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    headers: MessageHeaders,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    message: QueuedMessage,
}

enum Next {
    Delivery(Delivery),
    Wait(Arc<Notify>),
    Closed,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_journal_capacity(DEFAULT_JOURNAL_CAPACITY)
    }

    /// A broker keeping at most `capacity` entries per inspection journal
    pub fn with_journal_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(State {
                reachable: true,
                next_id: 0,
                journal_capacity: capacity,
                connections: HashSet::new(),
                channels: HashMap::new(),
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
                published: VecDeque::new(),
                settlements: VecDeque::new(),
                dead_letters: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a connection; fails while the broker is unreachable
    pub fn connect(&self) -> BusResult<InMemoryConnection> {
        let mut state = self.state();
        if !state.reachable {
            return Err(BusError::Connection("broker unreachable".to_string()));
        }

        let id = state.allocate_id();
        state.connections.insert(id);

        Ok(InMemoryConnection {
            broker: self.clone(),
            id,
        })
    }

    /// Simulate the broker going down (or coming back)
    ///
    /// While unreachable, new connections and channels fail, publishes fail,
    /// and active consumer streams end.
    pub fn set_reachable(&self, reachable: bool) {
        let notifies: Vec<Arc<Notify>> = {
            let mut state = self.state();
            state.reachable = reachable;
            state.queues.values().map(|q| q.notify.clone()).collect()
        };
        for notify in notifies {
            notify.notify_one();
        }
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Binding keys attached to `queue`
    pub fn bindings_for(&self, queue: &str) -> Vec<String> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.binding_key.clone())
            .collect()
    }

    /// Messages waiting in `queue` (not yet delivered)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Envelopes accepted by an exchange, routable or not, oldest first
    pub fn published(&self) -> Vec<MessageEnvelope> {
        self.state().published.iter().cloned().collect()
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state().settlements.iter().cloned().collect()
    }

    /// Deliveries rejected without requeue
    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.state().dead_letters.iter().cloned().collect()
    }

    pub fn open_channel_count(&self) -> usize {
        self.state().channels.len()
    }

    pub fn open_connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Poll until at least `count` settlements were recorded
    ///
    /// Intended for tests; wrap it in `tokio::time::timeout`.
    pub async fn wait_for_settlements(&self, count: usize) -> Vec<SettlementRecord> {
        loop {
            let settlements = self.settlements();
            if settlements.len() >= count {
                return settlements;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn next_delivery(&self, channel_id: u64, queue: &str) -> Next {
        let mut state = self.state();
        if !state.reachable {
            return Next::Closed;
        }

        if !state.channels.contains_key(&channel_id) {
            return Next::Closed;
        }

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Next::Closed;
        };
        let Some(message) = queue_state.ready.pop_front() else {
            return Next::Wait(queue_state.notify.clone());
        };

        let Some(channel) = state.channels.get_mut(&channel_id) else {
            return Next::Closed;
        };
        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;

        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            body: message.body.clone(),
            headers: message.headers.clone(),
        };
        channel.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                message,
            },
        );

        Next::Delivery(delivery)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&mut self, channel_id: u64) -> BusResult<&mut ChannelState> {
        if !self.reachable {
            return Err(BusError::Connection("broker unreachable".to_string()));
        }
        self.channels
            .get_mut(&channel_id)
            .ok_or_else(|| BusError::Channel(format!("channel {channel_id} is closed")))
    }

    fn check_owner(&self, queue: &str, connection_id: u64) -> BusResult<()> {
        match self.queues.get(queue) {
            None => Err(BusError::Declare(format!("queue '{queue}': NOT_FOUND"))),
            Some(q) if q.owner_connection != connection_id => Err(BusError::Channel(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{queue}'"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Return a channel's unacked deliveries to their queues, in tag order
    fn requeue_unacked(&mut self, channel_id: u64) -> Vec<Arc<Notify>> {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Vec::new();
        };
        let mut pending: Vec<(u64, Unacked)> = channel.unacked.drain().collect();
        pending.sort_by(|a, b| b.0.cmp(&a.0));

        let mut notifies = Vec::new();
        for (_, unacked) in pending {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                notifies.push(queue.notify.clone());
            }
        }
        notifies
    }

    fn close_channel(&mut self, channel_id: u64) -> Vec<Arc<Notify>> {
        let mut notifies = self.requeue_unacked(channel_id);
        if let Some(channel) = self.channels.remove(&channel_id) {
            for queue in channel.consuming {
                if let Some(q) = self.queues.get(&queue) {
                    notifies.push(q.notify.clone());
                }
            }
        }
        notifies
    }
}

fn record<T>(journal: &mut VecDeque<T>, capacity: usize, entry: T) {
    if capacity == 0 {
        return;
    }
    while journal.len() >= capacity {
        journal.pop_front();
    }
    journal.push_back(entry);
}

/// A connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Broker for InMemoryConnection {
    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.state();
        if !state.reachable {
            return Err(BusError::Connection("broker unreachable".to_string()));
        }
        if !state.connections.contains(&self.id) {
            return Err(BusError::Connection(format!("connection {} is closed", self.id)));
        }

        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                next_tag: 0,
                unacked: HashMap::new(),
                consuming: Vec::new(),
            },
        );

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
            connection_id: self.id,
        }))
    }

    fn is_connected(&self) -> bool {
        let state = self.broker.state();
        state.reachable && state.connections.contains(&self.id)
    }

    async fn close(&self) -> BusResult<()> {
        let notifies = {
            let mut state = self.broker.state();
            let channel_ids: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, c)| c.connection_id == self.id)
                .map(|(id, _)| *id)
                .collect();

            let mut notifies = Vec::new();
            for channel_id in channel_ids {
                notifies.extend(state.close_channel(channel_id));
            }

            // Exclusive queues die with their connection
            let owned: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.owner_connection == self.id)
                .map(|(name, _)| name.clone())
                .collect();
            for name in owned {
                if let Some(queue) = state.queues.remove(&name) {
                    notifies.push(queue.notify);
                }
                state.bindings.retain(|b| b.queue != name);
            }

            state.connections.remove(&self.id);
            notifies
        };

        for notify in notifies {
            notify.notify_one();
        }
        Ok(())
    }
}

/// A channel on an [`InMemoryConnection`]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    connection_id: u64,
}

impl InMemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn settle(&self, delivery_tag: u64, settlement: Settlement) -> BusResult<()> {
        let notify = {
            let mut state = self.broker.state();
            let channel = state.channel(self.id)?;
            let unacked = channel
                .unacked
                .remove(&delivery_tag)
                .ok_or(BusError::UnknownDeliveryTag(delivery_tag))?;

            let capacity = state.journal_capacity;
            let entry = SettlementRecord {
                channel_id: self.id,
                delivery_tag,
                routing_key: unacked.message.routing_key.clone(),
                redelivered: unacked.message.redelivered,
                settlement,
            };
            record(&mut state.settlements, capacity, entry);

            match settlement {
                Settlement::Ack => None,
                Settlement::RejectRequeue => {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    state.queues.get_mut(&unacked.queue).map(|queue| {
                        queue.ready.push_front(message);
                        queue.notify.clone()
                    })
                }
                Settlement::RejectNoRequeue => {
                    let message = unacked.message;
                    let dead = Delivery {
                        delivery_tag,
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        redelivered: message.redelivered,
                        body: message.body,
                        headers: message.headers,
                    };
                    record(&mut state.dead_letters, capacity, dead);
                    None
                }
            }
        };

        if let Some(notify) = notify {
            notify.notify_one();
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        let mut state = self.broker.state();
        state.channel(self.id)?;

        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing != spec {
                return Err(BusError::Declare(format!(
                    "exchange '{}': PRECONDITION_FAILED - inequivalent arguments",
                    spec.name
                )));
            }
            return Ok(());
        }

        state.exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn declare_exclusive_queue(&self) -> BusResult<String> {
        let mut state = self.broker.state();
        state.channel(self.id)?;

        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        state.queues.insert(
            name.clone(),
            QueueState {
                owner_connection: self.connection_id,
                ready: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> BusResult<()> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        state.check_owner(queue, self.connection_id)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Declare(format!("exchange '{exchange}': NOT_FOUND")));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            binding_key: binding_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope) -> BusResult<()> {
        let notifies = {
            let mut state = self.broker.state();
            state
                .channel(self.id)
                .map_err(|e| BusError::Publish(e.to_string()))?;
            if !state.exchanges.contains_key(&envelope.exchange) {
                return Err(BusError::Publish(format!(
                    "exchange '{}': NOT_FOUND",
                    envelope.exchange
                )));
            }

            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| {
                    b.exchange == envelope.exchange
                        && topic_matches(&b.binding_key, &envelope.routing_key)
                })
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();

            if targets.is_empty() {
                tracing::debug!(
                    exchange = %envelope.exchange,
                    routing_key = %envelope.routing_key,
                    "Unroutable message dropped"
                );
            }

            let mut notifies = Vec::new();
            for target in targets {
                if let Some(queue) = state.queues.get_mut(&target) {
                    queue.ready.push_back(QueuedMessage {
                        exchange: envelope.exchange.clone(),
                        routing_key: envelope.routing_key.clone(),
                        body: envelope.body.clone(),
                        headers: envelope.headers.clone(),
                        redelivered: false,
                    });
                    notifies.push(queue.notify.clone());
                }
            }

            let capacity = state.journal_capacity;
            record(&mut state.published, capacity, envelope);
            notifies
        };

        for notify in notifies {
            notify.notify_one();
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> BusResult<BoxStream<'static, BusResult<Delivery>>> {
        {
            let mut state = self.broker.state();
            state.channel(self.id)?;
            state.check_owner(queue, self.connection_id)?;
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.consuming.push(queue.to_string());
            }
        }

        let broker = self.broker.clone();
        let channel_id = self.id;
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                match broker.next_delivery(channel_id, &queue) {
                    Next::Delivery(delivery) => yield Ok(delivery),
                    Next::Wait(notify) => notify.notified().await,
                    Next::Closed => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> BusResult<()> {
        self.settle(delivery_tag, Settlement::Ack)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BusResult<()> {
        let settlement = if requeue {
            Settlement::RejectRequeue
        } else {
            Settlement::RejectNoRequeue
        };
        self.settle(delivery_tag, settlement)
    }

    async fn close(&self) -> BusResult<()> {
        let notifies = self.broker.state().close_channel(self.id);
        for notify in notifies {
            notify.notify_one();
        }
        Ok(())
    }
}
