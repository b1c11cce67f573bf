// src/api.rs
// Process-wide entry points for applications that just want to publish or
// consume with the loaded configuration.

use std::future::Future;

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::config::Settings;
use crate::message::Message;
use crate::rabbitmq::amqp_client::PublishBroker;
use crate::rabbitmq::binding::Binding;
use crate::rabbitmq::channel_manager::LapinPublisher;
use crate::rabbitmq::consumer::{ConsumerSession, MessageHandler};
use crate::rabbitmq::errors::Result;
use crate::rabbitmq::publisher::PublisherSession;

/// A publisher connected on first use and reused by every later caller.
/// Publishes through it are serialized.
pub struct SharedPublisher<B: PublishBroker = LapinPublisher> {
    session: OnceCell<Mutex<PublisherSession<B>>>,
}

impl<B: PublishBroker> SharedPublisher<B> {
    pub const fn new() -> Self {
        SharedPublisher {
            session: OnceCell::const_new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.initialized()
    }

    /// Publishes `message`, running `connect` first if no session exists yet.
    /// A failed `connect` leaves nothing behind, so the next call tries again.
    pub async fn publish<F, Fut>(&self, connect: F, message: &mut Message) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PublisherSession<B>>>,
    {
        let publisher = self
            .session
            .get_or_try_init(|| async {
                debug!("Creating the shared publisher");
                connect().await.map(Mutex::new)
            })
            .await?;

        publisher.lock().await.publish(message).await
    }
}

impl<B: PublishBroker> Default for SharedPublisher<B> {
    fn default() -> Self {
        SharedPublisher::new()
    }
}

static PUBLISHER: SharedPublisher = SharedPublisher::new();

/// Publishes through the process-wide publisher.
///
/// The publisher is created from the `settings` of the first successful
/// call; later calls reuse it.
pub async fn publish(settings: &Settings, message: &mut Message) -> Result<()> {
    PUBLISHER
        .publish(
            || PublisherSession::open(settings, None, None, settings.confirms),
            message,
        )
        .await
}

/// Consumes with `handler` until the process exits. Falls back to the
/// configured bindings when none are given.
pub async fn consume<H: MessageHandler>(
    settings: &Settings,
    handler: H,
    bindings: Option<Vec<Binding>>,
) -> Result<()> {
    let bindings = bindings.unwrap_or_else(|| settings.bindings.clone());
    ConsumerSession::from_settings(settings).consume(handler, bindings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::errors::{HandlerError, MessagingError};
    use crate::rabbitmq::memory::MemoryBroker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn connect(broker: &MemoryBroker, attempts: &AtomicUsize) -> Result<PublisherSession<MemoryBroker>> {
        attempts.fetch_add(1, Ordering::SeqCst);
        let mut session = PublisherSession::new(broker.clone(), "amq.topic", true);
        session.connect().await?;
        Ok(session)
    }

    #[tokio::test]
    async fn test_shared_publisher_connects_once() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "q", "#");
        let shared: SharedPublisher<MemoryBroker> = SharedPublisher::new();
        let attempts = AtomicUsize::new(0);
        assert!(!shared.is_initialized());

        for n in 0..3 {
            let mut message = Message::new("org.fedoraproject.test", json!({"n": n}));
            shared.publish(|| connect(&broker, &attempts), &mut message).await.unwrap();
        }

        assert!(shared.is_initialized());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connection_attempts(), 1);
        assert_eq!(broker.published().len(), 3);
        assert_eq!(broker.queue_depth("q"), 3);
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried_on_next_publish() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "q", "#");
        broker.refuse_connections(1);
        let shared: SharedPublisher<MemoryBroker> = SharedPublisher::new();
        let attempts = AtomicUsize::new(0);

        let mut message = Message::new("org.fedoraproject.test", json!({}));
        let err = shared.publish(|| connect(&broker, &attempts), &mut message).await.unwrap_err();
        assert!(matches!(err, MessagingError::ConnectionError(_)));
        assert!(!shared.is_initialized());

        shared.publish(|| connect(&broker, &attempts), &mut message).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_consume_without_bindings() {
        let settings = Settings::default();
        let handler = |_: Message| async { Ok::<(), HandlerError>(()) };

        let err = consume(&settings, handler, None).await.unwrap_err();
        assert!(matches!(err, MessagingError::ConfigError(_)));
    }
}
