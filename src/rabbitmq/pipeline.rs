// src/rabbitmq/pipeline.rs
// Turns a raw delivery into a Message: decode, parse, resolve schema, validate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use super::amqp_client::InboundDelivery;
use super::properties::CONTENT_ENCODING_UTF8;
use crate::message::{Message, SchemaRegistry, ValidationError};

/// What to do with a delivery whose body or schema does not check out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Log the problem and hand the best-effort message to the handler anyway.
    #[default]
    Lenient,
    /// Reject the delivery without requeueing it; the handler never sees it.
    Strict,
}

#[derive(Debug, Error)]
pub enum Rejection {
    #[error("body could not be decoded as {0}")]
    Undecodable(String),

    #[error("body is not valid JSON: {0}")]
    Unparseable(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Clone, Debug, Default)]
pub struct InboundPipeline {
    registry: SchemaRegistry,
    policy: DecodePolicy,
}

impl InboundPipeline {
    pub fn new(registry: SchemaRegistry, policy: DecodePolicy) -> Self {
        InboundPipeline { registry, policy }
    }

    pub fn policy(&self) -> DecodePolicy {
        self.policy
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn decode(&self, delivery: &InboundDelivery) -> Result<Message, Rejection> {
        let tag = delivery.delivery_tag;

        let encoding = match delivery.properties.content_encoding.as_deref() {
            Some(encoding) => encoding.to_string(),
            None => {
                error!(delivery_tag = tag, "Message arrived without a content encoding");
                CONTENT_ENCODING_UTF8.to_string()
            }
        };

        let text = match decode_text(&delivery.body, &encoding) {
            Some(text) => text,
            None => {
                error!(delivery_tag = tag, %encoding, body = ?delivery.body, "Unable to decode message body");
                if self.policy == DecodePolicy::Strict {
                    return Err(Rejection::Undecodable(encoding));
                }
                String::from_utf8_lossy(&delivery.body).into_owned()
            }
        };

        let body = match serde_json::from_str::<Value>(&text) {
            Ok(body) => body,
            Err(e) => {
                error!(delivery_tag = tag, body = %text, error = %e, "Failed to load message body");
                if self.policy == DecodePolicy::Strict {
                    return Err(Rejection::Unparseable(e.to_string()));
                }
                Value::String(text)
            }
        };

        let headers = delivery.properties.headers.clone();
        let schema = match headers.get(crate::message::SCHEMA_HEADER).and_then(Value::as_str) {
            Some(name) => self.registry.get(name).unwrap_or_else(|| {
                error!(schema = name, "Message arrived with an unknown schema, using the base schema");
                self.registry.base()
            }),
            None => {
                error!(
                    ?headers,
                    %body,
                    "Message arrived without a schema header. A publisher is misbehaving!"
                );
                self.registry.base()
            }
        };

        let message = Message::from_parts(schema, delivery.routing_key.clone(), headers, body);

        match message.validate() {
            Ok(()) => debug!(?message, "Successfully validated message"),
            Err(e) => {
                error!(?message, error = %e, "Message validation failed");
                if self.policy == DecodePolicy::Strict {
                    return Err(Rejection::Invalid(e));
                }
            }
        }

        Ok(message)
    }
}

fn decode_text(bytes: &[u8], encoding: &str) -> Option<String> {
    match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
        "utf-8" | "utf8" => std::str::from_utf8(bytes).ok().map(str::to_owned),
        "ascii" | "us-ascii" => bytes
            .is_ascii()
            .then(|| String::from_utf8_lossy(bytes).into_owned()),
        "latin-1" | "latin1" | "iso-8859-1" => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        _ => None,
    }
}
