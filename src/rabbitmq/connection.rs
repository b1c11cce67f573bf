// src/rabbitmq/connection.rs
// lapin implementation of the consuming seam. Deliveries and close
// notifications are forwarded to the session as broker events.

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::amqp_client::{BrokerEvent, ConsumerBroker, EventSender, InboundDelivery};
use super::errors::{MessagingError, Result};
use super::properties::{json_to_field_table, DeliveryProperties};

/// Connection properties announcing this client to the broker.
pub fn connection_properties(client_properties: &Map<String, Value>) -> ConnectionProperties {
    let mut properties = ConnectionProperties::default();
    properties.client_properties = json_to_field_table(client_properties);
    properties
}

pub struct LapinConsumer {
    uri: String,
    client_properties: Map<String, Value>,
    connection: Option<Connection>,
    channel: Option<Channel>,
    events: Option<EventSender>,
    forwarders: Vec<JoinHandle<()>>,
}

impl LapinConsumer {
    pub fn new(uri: &str, client_properties: Map<String, Value>) -> Self {
        LapinConsumer {
            uri: uri.to_string(),
            client_properties,
            connection: None,
            channel: None,
            events: None,
            forwarders: Vec::new(),
        }
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| MessagingError::ConnectionError("No active connection".to_string()))
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| MessagingError::ChannelError("No open channel".to_string()))
    }

    fn events(&self) -> Result<EventSender> {
        self.events
            .clone()
            .ok_or_else(|| MessagingError::ConnectionError("No active connection".to_string()))
    }

    fn stop_forwarders(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

/// Pushes every delivery of `consumer` into the session until the stream ends.
async fn forward_deliveries(mut consumer: Consumer, consumer_tag: String, events: EventSender) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => {
                let inbound = InboundDelivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    properties: DeliveryProperties::from_basic_properties(&delivery.properties),
                    body: delivery.data,
                };
                if !events.send(BrokerEvent::Delivery(inbound)) {
                    return;
                }
            }
            Err(e) => {
                error!(%consumer_tag, error = %e, "Error receiving message");
                events.send(BrokerEvent::ChannelClosed(e.to_string()));
                return;
            }
        }
    }
    events.send(BrokerEvent::ConsumerCancelled(consumer_tag));
}

#[async_trait]
impl ConsumerBroker for LapinConsumer {
    async fn connect(&mut self, events: EventSender) -> Result<()> {
        self.stop_forwarders();
        self.channel = None;
        self.connection = None;

        info!("Attempting to connect to RabbitMQ at {}", self.uri);
        let connection = Connection::connect(&self.uri, connection_properties(&self.client_properties)).await?;

        let on_error = events.clone();
        connection.on_error(move |err| {
            on_error.send(BrokerEvent::ConnectionClosed(err.to_string()));
        });

        self.connection = Some(connection);
        self.events = Some(events);
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<()> {
        let channel = self.connection()?.create_channel().await?;

        let on_error = self.events()?;
        channel.on_error(move |err| {
            on_error.send(BrokerEvent::ChannelClosed(err.to_string()));
        });

        debug!(channel_id = channel.id(), "Channel opened");
        self.channel = Some(channel);
        Ok(())
    }

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<()> {
        self.channel()?
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<()> {
        self.channel()?
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &str, auto_delete: bool, arguments: &Map<String, Value>) -> Result<String> {
        let declared = self
            .channel()?
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete,
                    ..QueueDeclareOptions::default()
                },
                json_to_field_table(arguments),
            )
            .await?;
        debug!(%queue, messages = declared.message_count(), "Queue declared");
        Ok(declared.name().as_str().to_string())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel()?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<String> {
        let consumer_tag = format!("fedora-messaging-{}", Uuid::new_v4());
        let consumer = self
            .channel()?
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let events = self.events()?;
        self.forwarders
            .push(tokio::spawn(forward_deliveries(consumer, consumer_tag.clone(), events)));
        Ok(consumer_tag)
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        self.channel()?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel()?
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop_forwarders();
        self.channel = None;
        self.events = None;
        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                info!("Closing RabbitMQ connection gracefully");
                connection.close(200, "Consumer halted").await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{AMQPValue, ShortString};
    use serde_json::json;

    #[test]
    fn test_connection_properties_carry_client_properties() {
        let client = json!({"app": "Unit tests", "product": "fedora-messaging"});
        let properties = connection_properties(client.as_object().unwrap());

        let inner = properties.client_properties.inner();
        assert_eq!(
            inner.get(&ShortString::from("app")),
            Some(&AMQPValue::LongString("Unit tests".into()))
        );
        assert_eq!(inner.len(), 2);
    }

    #[tokio::test]
    async fn test_operations_without_connection_fail() {
        let mut consumer = LapinConsumer::new("amqp://localhost:5672/%2f", Map::new());

        let err = consumer.open_channel().await.unwrap_err();
        assert!(err.is_connection_error());

        let err = consumer.ack(1).await.unwrap_err();
        assert!(matches!(err, MessagingError::ChannelError(_)));

        consumer.close().await.unwrap();
    }
}
