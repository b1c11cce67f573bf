// src/rabbitmq/mod.rs
// AMQP transport: broker seams, lapin and in-memory brokers, and the
// publishing and consuming sessions built on them.

pub mod errors;
pub mod amqp_client;
pub mod properties;
pub mod binding;
pub mod backoff;
pub mod state_machine;
pub mod pipeline;
pub mod publisher;
pub mod consumer;
pub mod connection;
pub mod channel_manager;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{PublishBroker, PublishChannel, PublishFailure};
pub use binding::Binding;
pub use channel_manager::LapinPublisher;
pub use connection::LapinConsumer;
pub use consumer::{ConsumerControl, ConsumerSession, MessageHandler};
pub use errors::{HandlerError, MessagingError, Result};
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBroker;
pub use pipeline::DecodePolicy;
pub use publisher::PublisherSession;
pub use state_machine::SessionOutcome;
