// src/rabbitmq/amqp_client.rs
// Broker seams the sessions are written against. `connection` and
// `channel_manager` implement them with lapin, `memory` in-process.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use super::errors::{MessagingError, Result};
use super::properties::DeliveryProperties;
use super::state_machine::{Event, Notice};

/// Why a single publish attempt did not go through.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PublishFailure {
    #[error("message was nacked by the broker")]
    Nack,

    #[error("message could not be routed: {0}")]
    Unroutable(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("publish failed: {0}")]
    Other(String),
}

impl From<MessagingError> for PublishFailure {
    fn from(error: MessagingError) -> Self {
        if error.is_connection_lost() {
            PublishFailure::ConnectionClosed(error.to_string())
        } else {
            PublishFailure::Other(error.to_string())
        }
    }
}

impl From<lapin::Error> for PublishFailure {
    fn from(error: lapin::Error) -> Self {
        MessagingError::from(error).into()
    }
}

#[async_trait]
pub trait PublishBroker: Send + Sync {
    /// Opens a fresh connection and channel, with publisher confirms enabled
    /// when `confirms` is set.
    async fn open_channel(&self, confirms: bool) -> Result<Box<dyn PublishChannel>>;
}

#[async_trait]
pub trait PublishChannel: Send + Sync {
    /// Publishes and, with confirms enabled, waits for the broker's answer.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &DeliveryProperties,
    ) -> std::result::Result<(), PublishFailure>;

    async fn close(&self) -> Result<()>;
}

/// A message handed to the consumer by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub properties: DeliveryProperties,
    pub body: Vec<u8>,
}

/// Things the broker tells the consumer without being asked.
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerEvent {
    Delivery(InboundDelivery),
    ConsumerCancelled(String),
    ChannelClosed(String),
    ConnectionClosed(String),
}

/// Handle a broker implementation uses to push [`BrokerEvent`]s into the
/// consuming session. Events are stamped with the connection they belong to.
#[derive(Clone, Debug)]
pub struct EventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        EventSender { epoch, tx }
    }

    /// Returns false once the session has gone away.
    pub fn send(&self, event: BrokerEvent) -> bool {
        self.tx
            .send(Event::Connection {
                epoch: self.epoch,
                notice: Notice::Broker(event),
            })
            .is_ok()
    }
}

#[async_trait]
pub trait ConsumerBroker: Send {
    /// Opens a new connection. Asynchronous notifications for it go to `events`.
    async fn connect(&mut self, events: EventSender) -> Result<()>;

    async fn open_channel(&mut self) -> Result<()>;

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<()>;

    /// Declares a durable topic exchange.
    async fn declare_exchange(&mut self, exchange: &str) -> Result<()>;

    /// Declares a durable queue and returns the name the broker reports.
    /// An `auto_delete` queue is deleted once its last consumer is gone.
    async fn declare_queue(&mut self, queue: &str, auto_delete: bool, arguments: &Map<String, Value>)
        -> Result<String>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Starts consuming and returns the consumer tag.
    async fn start_consuming(&mut self, queue: &str) -> Result<String>;

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
