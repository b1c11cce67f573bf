use std::sync::Arc;
use tracing::{error, info, warn};

use super::amqp_client::{PublishBroker, PublishChannel, PublishFailure};
use super::channel_manager::LapinPublisher;
use super::errors::{MessagingError, Result};
use super::properties::DeliveryProperties;
use crate::config::Settings;
use crate::hooks::{PublishHooks, PublishObserver};
use crate::message::Message;

/// Publishes messages one at a time, waiting for the broker's confirmation.
///
/// A publish that finds the connection closed reconnects once and retries
/// once. Broker nacks and unroutable returns are not errors: they are reported
/// to the `publish_failed` hooks and `publish` returns `Ok(())`.
pub struct PublisherSession<B: PublishBroker = LapinPublisher> {
    broker: B,
    channel: Option<Box<dyn PublishChannel>>,
    exchange: String,
    confirms: bool,
    hooks: PublishHooks,
}

impl PublisherSession<LapinPublisher> {
    /// Connects to the broker right away. `amqp_url` and `exchange` fall back
    /// to the configured values.
    pub async fn open(
        settings: &Settings,
        amqp_url: Option<&str>,
        exchange: Option<&str>,
        confirms: bool,
    ) -> Result<Self> {
        let url = amqp_url.unwrap_or(&settings.amqp_url);
        let broker = LapinPublisher::new(url, settings.client_properties.clone());
        let exchange = exchange.unwrap_or(&settings.publish_exchange);

        let mut session = PublisherSession::new(broker, exchange, confirms);
        session.connect().await?;
        Ok(session)
    }
}

impl<B: PublishBroker> PublisherSession<B> {
    /// Creates a session that connects on its first publish.
    pub fn new(broker: B, exchange: &str, confirms: bool) -> Self {
        PublisherSession {
            broker,
            channel: None,
            exchange: exchange.to_string(),
            confirms,
            hooks: PublishHooks::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PublishObserver>) -> Self {
        self.hooks.attach(observer);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        let channel = self.broker.open_channel(self.confirms).await?;
        info!(exchange = %self.exchange, confirms = self.confirms, "Publisher connected");
        self.channel = Some(channel);
        Ok(())
    }

    pub async fn publish(&mut self, message: &mut Message) -> Result<()> {
        self.hooks.before_publish(message)?;

        // Consumers use these to pick a schema and to notice they are out of date
        message.stamp_schema_headers();

        // Hooks may have changed the message, so validate what will be sent
        message.validate()?;

        let payload = serde_json::to_vec(&message.body)?;
        let properties = DeliveryProperties::for_message(message);

        if self.channel.is_none() {
            self.connect().await?;
        }

        match self.attempt(message, &payload, &properties).await {
            Ok(()) => self.hooks.published(message),
            Err(PublishFailure::ConnectionClosed(reason)) => {
                warn!(%reason, exchange = %self.exchange, "Connection closed; attempting to reconnect...");
                self.channel = None;
                self.connect().await?;
                info!("Successfully reopened connection, retrying publish");

                match self.attempt(message, &payload, &properties).await {
                    Ok(()) => self.hooks.published(message),
                    Err(PublishFailure::ConnectionClosed(reason)) => {
                        error!(%reason, "Publish failed again after reconnecting");
                        self.channel = None;
                        Err(MessagingError::ConnectionError(reason))
                    }
                    Err(PublishFailure::Other(reason)) => Err(MessagingError::PublishError(reason)),
                    Err(failure) => self.report_failure(message, &failure),
                }
            }
            Err(PublishFailure::Other(reason)) => Err(MessagingError::PublishError(reason)),
            Err(failure) => self.report_failure(message, &failure),
        }
    }

    async fn attempt(
        &self,
        message: &Message,
        payload: &[u8],
        properties: &DeliveryProperties,
    ) -> std::result::Result<(), PublishFailure> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| PublishFailure::ConnectionClosed("no open channel".to_string()))?;

        channel
            .publish(&self.exchange, &message.topic, payload, properties)
            .await?;

        info!(
            "Published message to exchange '{}' with routing key '{}'",
            self.exchange, message.topic
        );
        Ok(())
    }

    fn report_failure(&self, message: &Message, failure: &PublishFailure) -> Result<()> {
        error!(topic = %message.topic, error = %failure, "Message was not published");
        self.hooks.publish_failed(message, failure)
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            channel.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageSchema, ValidationError, SCHEMA_HEADER, SCHEMA_VERSION_HEADER};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        connects: usize,
        refuse_connects: usize,
        outcomes: VecDeque<std::result::Result<(), PublishFailure>>,
        published: Vec<(String, String, Vec<u8>, DeliveryProperties)>,
    }

    #[derive(Clone, Default)]
    struct ScriptedBroker {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedBroker {
        fn with_outcomes(outcomes: Vec<std::result::Result<(), PublishFailure>>) -> Self {
            let broker = ScriptedBroker::default();
            broker.script.lock().unwrap().outcomes = outcomes.into();
            broker
        }
    }

    struct ScriptedChannel {
        script: Arc<Mutex<Script>>,
    }

    #[async_trait]
    impl PublishBroker for ScriptedBroker {
        async fn open_channel(&self, _confirms: bool) -> Result<Box<dyn PublishChannel>> {
            let mut script = self.script.lock().unwrap();
            script.connects += 1;
            if script.refuse_connects > 0 {
                script.refuse_connects -= 1;
                return Err(MessagingError::ConnectionError("connection refused".into()));
            }
            Ok(Box::new(ScriptedChannel { script: self.script.clone() }))
        }
    }

    #[async_trait]
    impl PublishChannel for ScriptedChannel {
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            payload: &[u8],
            properties: &DeliveryProperties,
        ) -> std::result::Result<(), PublishFailure> {
            let mut script = self.script.lock().unwrap();
            script.published.push((
                exchange.to_string(),
                routing_key.to_string(),
                payload.to_vec(),
                properties.clone(),
            ));
            script.outcomes.pop_front().unwrap_or(Ok(()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl PublishObserver for Recorder {
        fn before_publish(&self, message: &mut Message) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("before".into());
            // Validation must see the header stamping, which happens after this hook.
            assert!(message.declared_schema().is_none());
            Ok(())
        }

        fn published(&self, _message: &Message) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("published".into());
            Ok(())
        }

        fn publish_failed(&self, message: &Message, error: &PublishFailure) -> anyhow::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("failed:{}:{}", message.topic, error));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct RequiresAuthor;

    impl MessageSchema for RequiresAuthor {
        fn name(&self) -> &str {
            "test.schema:RequiresAuthor"
        }

        fn version(&self) -> u32 {
            2
        }

        fn validate(&self, message: &Message) -> std::result::Result<(), ValidationError> {
            // Headers must already be stamped when validation runs.
            if message.declared_schema() != Some(self.name()) {
                return Err(ValidationError::new(self.name(), "schema header missing"));
            }
            match message.body.get("author") {
                Some(Value::String(_)) => Ok(()),
                _ => Err(ValidationError::new(self.name(), "author missing")),
            }
        }
    }

    fn session(broker: &ScriptedBroker) -> (PublisherSession<ScriptedBroker>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let session = PublisherSession::new(broker.clone(), "amq.topic", true).with_observer(recorder.clone());
        (session, recorder)
    }

    #[tokio::test]
    async fn test_publish() {
        let broker = ScriptedBroker::default();
        let (mut session, recorder) = session(&broker);
        let mut message = Message::new("test.topic", json!({"test": "message"}));

        session.publish(&mut message).await.unwrap();

        let script = broker.script.lock().unwrap();
        assert_eq!(script.connects, 1);
        assert_eq!(script.published.len(), 1);
        let (exchange, routing_key, payload, properties) = &script.published[0];
        assert_eq!(exchange, "amq.topic");
        assert_eq!(routing_key, "test.topic");
        assert_eq!(payload, br#"{"test":"message"}"#);
        assert_eq!(properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(properties.content_encoding.as_deref(), Some("utf-8"));
        assert_eq!(properties.delivery_mode, Some(2));
        assert_eq!(properties.headers[SCHEMA_HEADER], json!("fedora_messaging.message:Message"));
        assert_eq!(properties.headers[SCHEMA_VERSION_HEADER], json!(1));
        assert!(properties.message_id.is_some());
        assert_eq!(recorder.events(), vec!["before", "published"]);
    }

    #[tokio::test]
    async fn test_hook_mutation_is_validated_and_sent() {
        struct AddAuthor;
        impl PublishObserver for AddAuthor {
            fn before_publish(&self, message: &mut Message) -> anyhow::Result<()> {
                message.body["author"] = json!("jcline");
                Ok(())
            }
        }

        let broker = ScriptedBroker::default();
        let mut session = PublisherSession::new(broker.clone(), "amq.topic", true).with_observer(Arc::new(AddAuthor));
        let mut message = Message::with_schema(Arc::new(RequiresAuthor), "t", json!({}));

        session.publish(&mut message).await.unwrap();

        let script = broker.script.lock().unwrap();
        assert_eq!(script.published[0].2, br#"{"author":"jcline"}"#);
        assert_eq!(script.published[0].3.headers[SCHEMA_VERSION_HEADER], json!(2));
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let broker = ScriptedBroker::default();
        let (mut session, recorder) = session(&broker);
        let mut message = Message::with_schema(Arc::new(RequiresAuthor), "t", json!({}));

        let err = session.publish(&mut message).await.unwrap_err();

        assert!(matches!(err, MessagingError::ValidationError(_)));
        assert!(broker.script.lock().unwrap().published.is_empty());
        assert_eq!(recorder.events(), vec!["before"]);
    }

    #[tokio::test]
    async fn test_publish_rejected_reports_through_hook() {
        let broker = ScriptedBroker::with_outcomes(vec![
            Err(PublishFailure::Nack),
            Err(PublishFailure::Unroutable("NO_ROUTE".into())),
        ]);
        let (mut session, recorder) = session(&broker);

        session.publish(&mut Message::new("a", json!({}))).await.unwrap();
        session.publish(&mut Message::new("b", json!({}))).await.unwrap();

        assert_eq!(
            recorder.events(),
            vec![
                "before",
                "failed:a:message was nacked by the broker",
                "before",
                "failed:b:message could not be routed: NO_ROUTE",
            ]
        );
        assert_eq!(broker.script.lock().unwrap().connects, 1);
    }

    #[tokio::test]
    async fn test_publish_disconnected_reconnects_once() {
        let broker = ScriptedBroker::with_outcomes(vec![Err(PublishFailure::ConnectionClosed("reset".into()))]);
        let (mut session, recorder) = session(&broker);

        session.publish(&mut Message::new("t", json!({}))).await.unwrap();

        let script = broker.script.lock().unwrap();
        assert_eq!(script.connects, 2);
        assert_eq!(script.published.len(), 2);
        // Same message id on the retry.
        assert_eq!(script.published[0].3, script.published[1].3);
        assert_eq!(recorder.events(), vec!["before", "published"]);
    }

    #[tokio::test]
    async fn test_retry_never_happens_twice() {
        let broker = ScriptedBroker::with_outcomes(vec![
            Err(PublishFailure::ConnectionClosed("reset".into())),
            Err(PublishFailure::ConnectionClosed("reset again".into())),
        ]);
        let (mut session, recorder) = session(&broker);

        let err = session.publish(&mut Message::new("t", json!({}))).await.unwrap_err();

        assert!(matches!(err, MessagingError::ConnectionError(_)));
        let script = broker.script.lock().unwrap();
        assert_eq!(script.connects, 2);
        assert_eq!(script.published.len(), 2);
        assert_eq!(recorder.events(), vec!["before"]);
        drop(script);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_retry_nack_reports_through_hook() {
        let broker = ScriptedBroker::with_outcomes(vec![
            Err(PublishFailure::ConnectionClosed("reset".into())),
            Err(PublishFailure::Nack),
        ]);
        let (mut session, recorder) = session(&broker);

        session.publish(&mut Message::new("t", json!({}))).await.unwrap();
        assert_eq!(recorder.events(), vec!["before", "failed:t:message was nacked by the broker"]);
    }

    #[tokio::test]
    async fn test_reconnect_failure_propagates() {
        let broker = ScriptedBroker::with_outcomes(vec![Err(PublishFailure::ConnectionClosed("reset".into()))]);
        let (mut session, recorder) = session(&broker);
        session.connect().await.unwrap();
        broker.script.lock().unwrap().refuse_connects = 1;

        let err = session.publish(&mut Message::new("t", json!({}))).await.unwrap_err();

        assert!(matches!(err, MessagingError::ConnectionError(_)));
        assert_eq!(broker.script.lock().unwrap().published.len(), 1);
        assert_eq!(recorder.events(), vec!["before"]);
    }

    #[tokio::test]
    async fn test_other_failures_propagate() {
        let broker = ScriptedBroker::with_outcomes(vec![Err(PublishFailure::Other("frame too large".into()))]);
        let (mut session, _recorder) = session(&broker);

        let err = session.publish(&mut Message::new("t", json!({}))).await.unwrap_err();
        assert!(matches!(err, MessagingError::PublishError(_)));
        assert_eq!(broker.script.lock().unwrap().connects, 1);
    }
}
