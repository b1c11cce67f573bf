// These tests talk to a real RabbitMQ broker at AMQP_ADDR (or localhost) and
// are ignored by default. Run them with `cargo test -- --ignored`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lapin::options::{QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Connection, ConnectionProperties};
use serde_json::json;

use fedora_messaging::rabbitmq::consumer::ConsumerSession;
use fedora_messaging::{Binding, HandlerError, Message, PublisherSession, SessionOutcome, Settings};

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.apply_overrides(std::env::var("AMQP_ADDR").ok());
    settings
}

/// Declares a short-lived queue bound to `routing_key` on amq.topic.
async fn declare_queue(settings: &Settings, routing_key: &str) -> String {
    let queue = format!("fedora-messaging-test-{}", uuid::Uuid::new_v4());
    let connection = Connection::connect(&settings.amqp_url, ConnectionProperties::default())
        .await
        .expect("Failed to connect to RabbitMQ");
    let channel = connection.create_channel().await.unwrap();

    let mut arguments = FieldTable::default();
    arguments.insert("x-expires".into(), AMQPValue::LongLongInt(60_000));
    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            arguments,
        )
        .await
        .unwrap();
    channel
        .queue_bind(&queue, "amq.topic", routing_key, QueueBindOptions::default(), FieldTable::default())
        .await
        .unwrap();
    connection.close(200, "done").await.unwrap();
    queue
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_connection_establishes() {
    let settings = settings();
    let mut publisher = PublisherSession::open(&settings, None, None, true).await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_publish_and_consume_round_trip() {
    let settings = settings();
    let topic = format!("fedora_messaging.test.{}", uuid::Uuid::new_v4().simple());
    let queue = declare_queue(&settings, &topic).await;

    let mut publisher = PublisherSession::open(&settings, None, None, true).await.unwrap();
    let mut message = Message::new(topic.as_str(), json!({"hello": "world"}));
    publisher.publish(&mut message).await.unwrap();
    publisher.close().await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = move |message: Message| {
        sink.lock().unwrap().push(message);
        async { Err::<(), _>(HandlerError::Halt) }
    };

    let binding = Binding::new("amq.topic", queue.as_str(), topic.as_str()).with_queue_argument("x-expires", 60_000);
    let mut session = ConsumerSession::from_settings(&settings);
    let outcome = tokio::time::timeout(Duration::from_secs(10), session.run(handler, vec![binding]))
        .await
        .expect("No message was consumed")
        .unwrap();

    assert_eq!(outcome, SessionOutcome::Halted);
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, topic);
    assert_eq!(received[0].body, json!({"hello": "world"}));
    assert_eq!(received[0].declared_schema(), Some("fedora_messaging.message:Message"));
}
