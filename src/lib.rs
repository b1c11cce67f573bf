//! Publish and consume schema-validated JSON messages over AMQP 0-9-1.
//!
//! [`PublisherSession`] sends one message at a time with publisher confirms
//! and a single reconnect-and-retry. [`ConsumerSession`] declares its
//! bindings, hands every delivery to a [`MessageHandler`] and reconnects with
//! a doubling backoff when the connection drops.

pub mod api;
pub mod config;
pub mod hooks;
pub mod message;
pub mod rabbitmq;

pub use config::Settings;
pub use hooks::{PublishHooks, PublishObserver};
pub use message::{BaseSchema, Message, MessageSchema, SchemaRegistry, ValidationError};
pub use rabbitmq::{
    Binding, ConsumerControl, ConsumerSession, DecodePolicy, HandlerError, MessageHandler, MessagingError,
    PublishFailure, PublisherSession, Result, SessionOutcome,
};
