// src/rabbitmq/errors.rs

use lapin::protocol::AMQPErrorKind;
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::message::ValidationError;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("AMQP connection error: {0}")]
    ConnectionError(String),

    #[error("AMQP channel error: {0}")]
    ChannelError(String),

    #[error("Message validation error: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Publish hook error: {0}")]
    HookError(#[source] anyhow::Error),

    #[error("Consume error: {0}")]
    ConsumeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    /// True when the failure took the whole connection down, not just a channel.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, MessagingError::ConnectionError(_))
    }

    /// True when the channel the operation ran on can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionError(_) | MessagingError::ChannelError(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for MessagingError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match &error {
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                MessagingError::ConnectionError(error_text)
            }
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Hard(_) => MessagingError::ConnectionError(error_text),
                AMQPErrorKind::Soft(_) => MessagingError::ChannelError(error_text),
            },
            _ => MessagingError::ChannelError(error_text),
        }
    }
}

/// What a consumer callback can report back about a message it was handed.
///
/// Every variant negatively acknowledges the delivery. `Nack` and `Drop` keep
/// the consumer running; `Halt` and `Failed` stop consumption entirely.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler asked for the message to be re-queued")]
    Nack,

    #[error("handler asked for the message to be dropped")]
    Drop,

    #[error("handler asked for the consumer to halt")]
    Halt,

    #[error("handler failed: {0}")]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn requeue(&self) -> bool {
        !matches!(self, HandlerError::Drop)
    }

    pub fn stops_consumer(&self) -> bool {
        matches!(self, HandlerError::Halt | HandlerError::Failed(_))
    }
}
