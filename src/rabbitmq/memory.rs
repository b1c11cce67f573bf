// src/rabbitmq/memory.rs
// In-process broker with topic routing, queues, delivery tags and fault
// injection. Lets both sessions run end to end without RabbitMQ.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::debug;

use super::amqp_client::{
    BrokerEvent, ConsumerBroker, EventSender, InboundDelivery, PublishBroker, PublishChannel, PublishFailure,
};
use super::errors::{MessagingError, Result};
use super::properties::DeliveryProperties;

/// Exchanges that exist without being declared.
const DEFAULT_EXCHANGES: [&str; 1] = ["amq.topic"];

/// A message as it sits in a queue.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: DeliveryProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    arguments: Map<String, Value>,
    auto_delete: bool,
    had_consumer: bool,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct ConsumerSlot {
    queue: String,
    connection: u64,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    connection: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<(String, String, String)>,
    consumers: HashMap<String, ConsumerSlot>,
    // Live connections; consuming ones carry their event sender.
    connections: HashMap<u64, Option<EventSender>>,
    unacked: HashMap<u64, Unacked>,
    next_connection: u64,
    next_delivery_tag: u64,
    next_consumer: u64,
    refuse_connections: usize,
    publish_failures: VecDeque<PublishFailure>,
    published: Vec<StoredMessage>,
    connection_times: Vec<Instant>,
    operations: Vec<String>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
}

impl BrokerState {
    fn open_connection(&mut self, events: Option<EventSender>) -> Result<u64> {
        self.connection_times.push(Instant::now());
        if self.refuse_connections > 0 {
            self.refuse_connections -= 1;
            return Err(MessagingError::ConnectionError("Connection refused".to_string()));
        }
        self.next_connection += 1;
        self.connections.insert(self.next_connection, events);
        Ok(self.next_connection)
    }

    fn is_live(&self, connection: u64) -> bool {
        self.connections.contains_key(&connection)
    }

    fn route(&mut self, message: StoredMessage) -> usize {
        let queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|(exchange, _, pattern)| {
                exchange == &message.exchange && topic_matches(pattern, &message.routing_key)
            })
            .map(|(_, queue, _)| queue.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for queue in &queues {
            if let Some(q) = self.queues.get_mut(queue) {
                q.ready.push_back(message.clone());
            }
            self.flush(queue);
        }
        queues.len()
    }

    /// Hands every ready message of `queue` to its first consumer, if it has one.
    fn flush(&mut self, queue: &str) {
        let Some((tag, connection)) = self
            .consumers
            .iter()
            .filter(|(_, slot)| slot.queue == queue)
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(tag, slot)| (tag.clone(), slot.connection))
        else {
            return;
        };
        let Some(Some(events)) = self.connections.get(&connection).cloned() else {
            return;
        };

        while let Some(message) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) {
            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            debug!(%queue, consumer_tag = %tag, delivery_tag, "Delivering message");

            let delivery = InboundDelivery {
                delivery_tag,
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    connection,
                    message,
                },
            );
            events.send(BrokerEvent::Delivery(delivery));
        }
    }

    /// Removes a connection and returns its unacknowledged messages to their queues.
    fn drop_connection(&mut self, connection: u64) -> Option<Option<EventSender>> {
        let events = self.connections.remove(&connection)?;
        self.consumers.retain(|_, slot| slot.connection != connection);
        self.remove_abandoned_queues();

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so push_front keeps delivery order.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(unacked.message);
                }
            }
        }
        Some(events)
    }

    /// Deletes auto-delete queues whose last consumer went away, with their bindings.
    fn remove_abandoned_queues(&mut self) {
        let consumed: HashSet<&String> = self.consumers.values().map(|slot| &slot.queue).collect();
        let abandoned: Vec<String> = self
            .queues
            .iter()
            .filter(|(name, q)| q.auto_delete && q.had_consumer && !consumed.contains(name))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in abandoned {
            debug!(%queue, "Deleting auto-delete queue");
            self.queues.remove(&queue);
            self.bindings.retain(|(_, bound, _)| bound != &queue);
        }
    }
}

/// Matches an AMQP topic binding pattern. `*` stands for exactly one word and
/// `#` for zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&k, key_rest)) => (word == "*" || word == k) && matches(rest, key_rest),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// Cloneable handle to one in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let state = BrokerState {
            exchanges: DEFAULT_EXCHANGES.iter().map(|name| name.to_string()).collect(),
            ..BrokerState::default()
        };
        MemoryBroker {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves the state consistent enough to inspect.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A consuming connection handle onto this broker.
    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            connection: None,
            channel_open: false,
        }
    }

    /// Declares `queue` and binds it, as an already running consumer would have.
    pub fn bind(&self, exchange: &str, queue: &str, routing_key: &str) {
        let mut state = self.lock();
        state.exchanges.insert(exchange.to_string());
        state.queues.entry(queue.to_string()).or_default();
        let binding = (exchange.to_string(), queue.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
    }

    /// The next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.lock().refuse_connections = count;
    }

    /// The next publish fails with `failure` instead of being routed.
    pub fn fail_next_publish(&self, failure: PublishFailure) {
        self.lock().publish_failures.push_back(failure);
    }

    /// Drops every open connection as if the broker went away.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let connections: Vec<u64> = state.connections.keys().copied().collect();
        for connection in connections {
            if let Some(Some(events)) = state.drop_connection(connection) {
                events.send(BrokerEvent::ConnectionClosed("CONNECTION_FORCED - broker shutdown".to_string()));
            }
        }
    }

    pub fn connection_attempts(&self) -> usize {
        self.lock().connection_times.len()
    }

    pub fn connection_times(&self) -> Vec<Instant> {
        self.lock().connection_times.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    pub fn published(&self) -> Vec<StoredMessage> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacked.clone()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }
}

#[async_trait]
impl PublishBroker for MemoryBroker {
    async fn open_channel(&self, confirms: bool) -> Result<Box<dyn PublishChannel>> {
        let connection = self.lock().open_connection(None)?;
        Ok(Box::new(MemoryPublishChannel {
            broker: self.clone(),
            connection,
            confirms,
        }))
    }
}

pub struct MemoryPublishChannel {
    broker: MemoryBroker,
    connection: u64,
    confirms: bool,
}

#[async_trait]
impl PublishChannel for MemoryPublishChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &DeliveryProperties,
    ) -> std::result::Result<(), PublishFailure> {
        let mut state = self.broker.lock();
        if let Some(failure) = state.publish_failures.pop_front() {
            return Err(failure);
        }
        if !state.is_live(self.connection) {
            return Err(PublishFailure::ConnectionClosed("connection reset by peer".to_string()));
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: payload.to_vec(),
        };
        state.published.push(message.clone());

        let routed = if state.exchanges.contains(exchange) {
            state.route(message)
        } else {
            0
        };
        // Without confirms the broker's return is never seen.
        if routed == 0 && self.confirms {
            return Err(PublishFailure::Unroutable("NO_ROUTE".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().drop_connection(self.connection);
        Ok(())
    }
}

/// Consuming side of a [`MemoryBroker`].
pub struct MemoryConsumer {
    broker: MemoryBroker,
    connection: Option<u64>,
    channel_open: bool,
}

impl MemoryConsumer {
    /// Locks the broker and checks this handle still has a live channel.
    fn channel(&self, operation: String) -> Result<MutexGuard<'_, BrokerState>> {
        let mut state = self.broker.lock();
        match self.connection {
            Some(connection) if state.is_live(connection) => {}
            _ => return Err(MessagingError::ConnectionError("connection reset by peer".to_string())),
        }
        if !self.channel_open {
            return Err(MessagingError::ChannelError("channel is closed".to_string()));
        }
        state.operations.push(operation);
        Ok(state)
    }
}

#[async_trait]
impl ConsumerBroker for MemoryConsumer {
    async fn connect(&mut self, events: EventSender) -> Result<()> {
        let mut state = self.broker.lock();
        if let Some(previous) = self.connection.take() {
            state.drop_connection(previous);
        }
        self.channel_open = false;
        state.operations.push("connect".to_string());
        self.connection = Some(state.open_connection(Some(events))?);
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<()> {
        self.channel_open = true;
        let result = self.channel("open_channel".to_string()).map(|_| ());
        self.channel_open = result.is_ok();
        result
    }

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<()> {
        self.channel(format!("qos {prefetch_count}"))?;
        Ok(())
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<()> {
        let mut state = self.channel(format!("declare_exchange {exchange}"))?;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &str, auto_delete: bool, arguments: &Map<String, Value>) -> Result<String> {
        let operation = if auto_delete {
            format!("declare_queue {queue} auto_delete")
        } else {
            format!("declare_queue {queue}")
        };
        let mut state = self.channel(operation)?;
        let equivalent = state
            .queues
            .get(queue)
            .map(|existing| existing.auto_delete == auto_delete && &existing.arguments == arguments);
        match equivalent {
            Some(false) => {
                drop(state);
                self.channel_open = false;
                Err(MessagingError::ChannelError(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{queue}'"
                )))
            }
            Some(true) => Ok(queue.to_string()),
            None => {
                state.queues.insert(
                    queue.to_string(),
                    MemoryQueue {
                        arguments: arguments.clone(),
                        auto_delete,
                        had_consumer: false,
                        ready: VecDeque::new(),
                    },
                );
                Ok(queue.to_string())
            }
        }
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.channel(format!("bind {queue} {exchange} {routing_key}"))?;
        if !state.exchanges.contains(exchange) || !state.queues.contains_key(queue) {
            drop(state);
            self.channel_open = false;
            return Err(MessagingError::ChannelError(format!(
                "NOT_FOUND - cannot bind '{queue}' to '{exchange}'"
            )));
        }
        let binding = (exchange.to_string(), queue.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<String> {
        let connection = self.connection.unwrap_or_default();
        let mut state = self.channel(format!("consume {queue}"))?;
        if let Some(q) = state.queues.get_mut(queue) {
            q.had_consumer = true;
        }
        state.next_consumer += 1;
        let consumer_tag = format!("ctag-{}", state.next_consumer);
        state.consumers.insert(
            consumer_tag.clone(),
            ConsumerSlot {
                queue: queue.to_string(),
                connection,
            },
        );
        state.flush(queue);
        Ok(consumer_tag)
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        let mut state = self.channel(format!("cancel {consumer_tag}"))?;
        state.consumers.remove(consumer_tag);
        state.remove_abandoned_queues();
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        let mut state = self.channel(format!("ack {delivery_tag}"))?;
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(MessagingError::ChannelError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.channel(format!("nack {delivery_tag}"))?;
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(MessagingError::ChannelError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };
        state.nacked.push((delivery_tag, requeue));
        // Requeued messages wait for the next consumer rather than looping back immediately.
        if requeue {
            if let Some(q) = state.queues.get_mut(&unacked.queue) {
                q.ready.push_front(unacked.message);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.channel_open = false;
        if let Some(connection) = self.connection.take() {
            let mut state = self.broker.lock();
            state.operations.push("close".to_string());
            state.drop_connection(connection);
        }
        Ok(())
    }
}
