// src/rabbitmq/channel_manager.rs
// lapin implementation of the publishing seam: one connection, one channel,
// optionally in confirm mode.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::{Channel, Connection};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::amqp_client::{PublishBroker, PublishChannel, PublishFailure};
use super::connection::connection_properties;
use super::errors::Result;
use super::properties::DeliveryProperties;

/// Configuration options for a publishing channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a short UUID)
    pub id: String,
}

impl ChannelConfig {
    pub fn new(confirm_mode: bool) -> Self {
        Self {
            confirm_mode,
            id: format!("publisher-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

/// Opens publishing channels against a real broker.
#[derive(Debug, Clone)]
pub struct LapinPublisher {
    uri: String,
    client_properties: Map<String, Value>,
}

impl LapinPublisher {
    pub fn new(uri: &str, client_properties: Map<String, Value>) -> Self {
        LapinPublisher {
            uri: uri.to_string(),
            client_properties,
        }
    }
}

#[async_trait]
impl PublishBroker for LapinPublisher {
    async fn open_channel(&self, confirms: bool) -> Result<Box<dyn PublishChannel>> {
        let config = ChannelConfig::new(confirms);
        info!(channel_id = %config.id, "Connecting to RabbitMQ at {}", self.uri);

        let connection = Connection::connect(&self.uri, connection_properties(&self.client_properties)).await?;
        let channel = connection.create_channel().await?;

        if config.confirm_mode {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
        }

        debug!(
            channel_id = %config.id,
            confirm = %config.confirm_mode,
            "Publishing channel ready"
        );

        Ok(Box::new(LapinPublishChannel {
            connection,
            channel,
            config,
        }))
    }
}

pub struct LapinPublishChannel {
    connection: Connection,
    channel: Channel,
    config: ChannelConfig,
}

impl LapinPublishChannel {
    fn is_healthy(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

#[async_trait]
impl PublishChannel for LapinPublishChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &DeliveryProperties,
    ) -> std::result::Result<(), PublishFailure> {
        if !self.is_healthy() {
            return Err(PublishFailure::ConnectionClosed(format!(
                "channel {} is not connected",
                self.config.id
            )));
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                properties.to_basic_properties(),
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(PublishFailure::Nack),
            Confirmation::Ack(Some(returned)) => {
                warn!(
                    channel_id = %self.config.id,
                    reply_code = returned.reply_code,
                    "Broker returned an unroutable message"
                );
                Err(PublishFailure::Unroutable(returned.reply_text.as_str().to_string()))
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            info!(channel_id = %self.config.id, "Closing publishing connection");
            self.connection.close(200, "Closing publisher").await?;
        }
        Ok(())
    }
}
