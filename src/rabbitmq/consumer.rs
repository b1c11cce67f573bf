// src/rabbitmq/consumer.rs
// Drives the consumer state machine against a broker: executes its commands,
// feeds completions back, and runs the handler for every delivery.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::amqp_client::{ConsumerBroker, EventSender, InboundDelivery};
use super::backoff::{Backoff, DEFAULT_MAX_INTERVAL};
use super::binding::Binding;
use super::connection::LapinConsumer;
use super::errors::{HandlerError, MessagingError, Result};
use super::pipeline::{DecodePolicy, InboundPipeline};
use super::state_machine::{Command, ConsumerStateMachine, Event, Notice, SessionOutcome};
use crate::config::Settings;
use crate::message::{Message, SchemaRegistry};

/// Receives every message the session consumes.
///
/// Returning `Ok` acknowledges the delivery. Any [`HandlerError`] nacks it;
/// see its variants for whether the message is requeued and whether the
/// session keeps consuming.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> std::result::Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Pauses, resumes or stops a running [`ConsumerSession`] from another task.
///
/// Pausing cancels the consumers but keeps the connection; messages already
/// prefetched are still handled. Stopping cancels the consumers and closes
/// the connection, after which `run` returns [`SessionOutcome::Stopped`]. A
/// stopped session stays stopped.
#[derive(Clone)]
pub struct ConsumerControl {
    state: Arc<watch::Sender<RunState>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Stopped,
}

impl RunState {
    fn event(self) -> Event {
        match self {
            RunState::Running => Event::Resume,
            RunState::Paused => Event::Pause,
            RunState::Stopped => Event::Stop,
        }
    }
}

impl ConsumerControl {
    fn new() -> Self {
        let (state, _) = watch::channel(RunState::Running);
        ConsumerControl { state: Arc::new(state) }
    }

    pub fn pause(&self) {
        self.transition(RunState::Running, RunState::Paused);
    }

    pub fn resume(&self) {
        self.transition(RunState::Paused, RunState::Running);
    }

    pub fn stop(&self) {
        self.state.send_replace(RunState::Stopped);
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.borrow() == RunState::Stopped
    }

    fn transition(&self, from: RunState, to: RunState) {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

pub struct ConsumerSession<B: ConsumerBroker = LapinConsumer> {
    broker: B,
    pipeline: InboundPipeline,
    retries: i32,
    retry_max_interval: Duration,
    prefetch_count: u16,
    control: ConsumerControl,
}

impl ConsumerSession<LapinConsumer> {
    pub fn from_settings(settings: &Settings) -> Self {
        let broker = LapinConsumer::new(&settings.amqp_url, settings.client_properties.clone());
        ConsumerSession::new(broker)
            .with_retry_policy(settings.retries, settings.retry_max_interval())
            .with_prefetch_count(settings.prefetch_count)
            .with_decode_policy(settings.decode_policy)
    }
}

impl<B: ConsumerBroker> ConsumerSession<B> {
    pub fn new(broker: B) -> Self {
        ConsumerSession {
            broker,
            pipeline: InboundPipeline::default(),
            retries: -1,
            retry_max_interval: DEFAULT_MAX_INTERVAL,
            prefetch_count: 0,
            control: ConsumerControl::new(),
        }
    }

    /// `retries` below zero reconnects forever.
    pub fn with_retry_policy(mut self, retries: i32, max_interval: Duration) -> Self {
        self.retries = retries;
        self.retry_max_interval = max_interval;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.pipeline = InboundPipeline::new(self.pipeline.registry().clone(), policy);
        self
    }

    pub fn with_registry(mut self, registry: SchemaRegistry) -> Self {
        self.pipeline = InboundPipeline::new(registry, self.pipeline.policy());
        self
    }

    pub fn control(&self) -> ConsumerControl {
        self.control.clone()
    }

    /// Consumes until the session stops for good and reports why.
    pub async fn run<H: MessageHandler>(&mut self, handler: H, bindings: Vec<Binding>) -> Result<SessionOutcome> {
        if bindings.is_empty() {
            return Err(MessagingError::ConfigError(
                "at least one binding is required to consume".to_string(),
            ));
        }

        if self.control.is_stopped() {
            info!("Consumer was stopped before it started");
            return Ok(SessionOutcome::Stopped);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut control = self.control.state.subscribe();
        let backoff = Backoff::new(self.retries, self.retry_max_interval);
        let mut machine = ConsumerStateMachine::new(bindings, backoff, self.prefetch_count);

        let mut commands: VecDeque<Command> = VecDeque::new();
        if *control.borrow_and_update() == RunState::Paused {
            commands.extend(machine.handle(Event::Pause));
        }
        commands.extend(machine.handle(Event::Start));

        loop {
            while let Some(command) = commands.pop_front() {
                let follow_up = self.execute(command, &mut machine, &handler, &tx).await;
                commands.extend(follow_up);
            }

            if let Some(outcome) = machine.outcome() {
                if outcome == SessionOutcome::RetriesExhausted {
                    if let Err(e) = self.broker.close().await {
                        warn!(error = %e, "Failed to close connection after giving up");
                    }
                }
                info!(?outcome, "Consumer session finished");
                return Ok(outcome);
            }

            // Control requests go ahead of queued deliveries.
            let event = tokio::select! {
                biased;
                changed = control.changed() => match changed {
                    Ok(()) => {
                        let state = *control.borrow_and_update();
                        state.event()
                    }
                    Err(_) => return Err(MessagingError::ConsumeError("consumer control closed".to_string())),
                },
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return Err(MessagingError::ConsumeError("event queue closed".to_string())),
                },
            };
            commands.extend(machine.handle(event));
        }
    }

    /// Consumes messages until stopped through [`ConsumerSession::control`].
    /// Otherwise it only returns if setting up fails: once the handler halts
    /// or retries run out, this keeps waiting without consuming anything.
    pub async fn consume<H: MessageHandler>(&mut self, handler: H, bindings: Vec<Binding>) -> Result<()> {
        let outcome = self.run(handler, bindings).await?;
        if outcome == SessionOutcome::Stopped {
            return Ok(());
        }
        warn!(?outcome, "Consumer stopped; waiting indefinitely");
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn execute<H: MessageHandler>(
        &mut self,
        command: Command,
        machine: &mut ConsumerStateMachine,
        handler: &H,
        tx: &mpsc::UnboundedSender<Event>,
    ) -> Vec<Command> {
        match command {
            Command::Connect { epoch } => {
                let notice = match self.broker.connect(EventSender::new(epoch, tx.clone())).await {
                    Ok(()) => Notice::Opened,
                    Err(e) => Notice::OpenFailed(e.to_string()),
                };
                machine.handle(Event::Connection { epoch, notice })
            }
            Command::OpenChannel => {
                let result = self.broker.open_channel().await.map(|_| Notice::ChannelOpened);
                complete(machine, result)
            }
            Command::SetQos(prefetch_count) => {
                let result = self.broker.set_qos(prefetch_count).await.map(|_| Notice::QosOk);
                complete(machine, result)
            }
            Command::DeclareExchange(index) => {
                let Some(binding) = machine.bindings().get(index).cloned() else {
                    return Vec::new();
                };
                let result = self
                    .broker
                    .declare_exchange(&binding.exchange)
                    .await
                    .map(|_| Notice::ExchangeDeclared(index));
                complete(machine, result)
            }
            Command::DeclareQueue(index) => {
                let Some(binding) = machine.bindings().get(index).cloned() else {
                    return Vec::new();
                };
                let arguments = binding.queue_arguments.clone().unwrap_or_default();
                let result = self
                    .broker
                    .declare_queue(&binding.queue_name, binding.queue_auto_delete, &arguments)
                    .await
                    .map(|queue| Notice::QueueDeclared { binding: index, queue });
                complete(machine, result)
            }
            Command::BindQueue(index) => {
                let Some(binding) = machine.bindings().get(index).cloned() else {
                    return Vec::new();
                };
                let result = self
                    .broker
                    .bind_queue(&binding.queue_name, &binding.exchange, &binding.routing_key)
                    .await;
                match result {
                    Ok(()) => info!(
                        queue = %binding.queue_name,
                        exchange = %binding.exchange,
                        routing_key = %binding.routing_key,
                        "Successfully bound queue to exchange"
                    ),
                    Err(ref e) => error!(queue = %binding.queue_name, error = %e, "Failed to bind queue"),
                }
                complete(machine, result.map(|_| Notice::QueueBound(index)))
            }
            Command::StartConsuming { queue } => {
                let result = self
                    .broker
                    .start_consuming(&queue)
                    .await
                    .map(|consumer_tag| Notice::ConsumeStarted { queue, consumer_tag });
                complete(machine, result)
            }
            Command::ScheduleReconnect(delay) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::ReconnectDue);
                });
                Vec::new()
            }
            Command::Process(delivery) => self.process(delivery, machine, handler).await,
            Command::Cancel(consumer_tag) => {
                if let Err(e) = self.broker.cancel(&consumer_tag).await {
                    warn!(%consumer_tag, error = %e, "Failed to cancel consumer");
                }
                Vec::new()
            }
            Command::Close => {
                if let Err(e) = self.broker.close().await {
                    warn!(error = %e, "Failed to close connection cleanly");
                }
                machine.finish_close();
                Vec::new()
            }
        }
    }

    async fn process<H: MessageHandler>(
        &mut self,
        delivery: InboundDelivery,
        machine: &mut ConsumerStateMachine,
        handler: &H,
    ) -> Vec<Command> {
        let delivery_tag = delivery.delivery_tag;

        let message = match self.pipeline.decode(&delivery) {
            Ok(message) => message,
            Err(rejection) => {
                warn!(delivery_tag, reason = %rejection, "Rejecting message without requeue");
                let result = self.broker.nack(delivery_tag, false).await;
                return settle(machine, result);
            }
        };

        info!(
            topic = %message.topic,
            delivery_tag,
            "Consuming message from topic {}",
            message.topic
        );

        match handler.handle(message).await {
            Ok(()) => {
                let result = self.broker.ack(delivery_tag).await;
                settle(machine, result)
            }
            Err(handler_error) => {
                match &handler_error {
                    HandlerError::Nack => info!(delivery_tag, "Returning message to the queue"),
                    HandlerError::Drop => info!(delivery_tag, "Consumer requested message be dropped"),
                    HandlerError::Halt => info!(delivery_tag, "Consumer indicated it wishes consumption to halt"),
                    HandlerError::Failed(e) => {
                        error!(delivery_tag, error = %e, "Received unexpected error from the message handler")
                    }
                }

                let result = self.broker.nack(delivery_tag, handler_error.requeue()).await;
                let mut commands = settle(machine, result);
                if handler_error.stops_consumer() {
                    commands.extend(machine.request_halt());
                }
                commands
            }
        }
    }
}

/// Feeds the outcome of a broker operation back into the machine.
fn complete(machine: &mut ConsumerStateMachine, result: Result<Notice>) -> Vec<Command> {
    let notice = match result {
        Ok(notice) => notice,
        Err(e) => Notice::OperationFailed {
            connection_lost: e.is_connection_error(),
            reason: e.to_string(),
        },
    };
    let epoch = machine.epoch();
    machine.handle(Event::Connection { epoch, notice })
}

/// Acks and nacks only produce events when they fail.
fn settle(machine: &mut ConsumerStateMachine, result: Result<()>) -> Vec<Command> {
    match result {
        Ok(()) => Vec::new(),
        Err(e) => {
            error!(error = %e, "Failed to settle delivery");
            complete(machine, Err(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;
    use crate::rabbitmq::properties::DeliveryProperties;
    use crate::rabbitmq::amqp_client::{PublishBroker, PublishChannel};
    use crate::message::{BASE_SCHEMA_NAME, SCHEMA_HEADER};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn properties() -> DeliveryProperties {
        let mut headers = serde_json::Map::new();
        headers.insert(SCHEMA_HEADER.into(), json!(BASE_SCHEMA_NAME));
        DeliveryProperties {
            content_type: Some("application/json".into()),
            content_encoding: Some("utf-8".into()),
            delivery_mode: Some(2),
            headers,
            message_id: Some("id".into()),
        }
    }

    async fn publish_raw(broker: &MemoryBroker, routing_key: &str, body: &[u8]) {
        let channel = broker.open_channel(true).await.unwrap();
        channel.publish("amq.topic", routing_key, body, &properties()).await.unwrap();
        channel.close().await.unwrap();
    }

    fn bindings() -> Vec<Binding> {
        vec![Binding::new("amq.topic", "walks", "silly.#")]
    }

    #[tokio::test]
    async fn test_run_requires_bindings() {
        let mut session = ConsumerSession::new(MemoryBroker::new().consumer());
        let handler = |_: Message| async { Ok::<(), HandlerError>(()) };

        let err = session.run(handler, Vec::new()).await.unwrap_err();
        assert!(matches!(err, MessagingError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_handler_errors_decide_ack_and_requeue() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "walks", "silly.#");
        for body in [r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#, r#"{"n":4}"#] {
            publish_raw(&broker, "silly.walk", body.as_bytes()).await;
        }

        let handler = |message: Message| async move {
            match message.body["n"].as_i64() {
                Some(1) => Ok(()),
                Some(2) => Err(HandlerError::Drop),
                Some(3) => Err(HandlerError::Nack),
                _ => Err(HandlerError::Halt),
            }
        };
        let mut session = ConsumerSession::new(broker.consumer());
        let outcome = session.run(handler, bindings()).await.unwrap();

        assert_eq!(outcome, SessionOutcome::Halted);
        assert_eq!(broker.acked(), vec![1]);
        assert_eq!(broker.nacked(), vec![(2, false), (3, true), (4, true)]);
        assert_eq!(broker.queue_depth("walks"), 2);
        assert_eq!(broker.consumer_count(), 0);
        assert_eq!(broker.open_connections(), 0);
        assert!(broker.operations().contains(&"cancel ctag-1".to_string()));
    }

    #[tokio::test]
    async fn test_handler_failure_stops_consumer() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "walks", "silly.#");
        publish_raw(&broker, "silly.walk", b"{}").await;
        publish_raw(&broker, "silly.walk", b"{}").await;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = move |_: Message| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::from(anyhow::anyhow!("database is down")))
            }
        };

        let mut session = ConsumerSession::new(broker.consumer());
        assert_eq!(session.run(handler, bindings()).await.unwrap(), SessionOutcome::Halted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.nacked(), vec![(1, true)]);
        // The second delivery was never settled and goes back when the connection closes.
        assert_eq!(broker.queue_depth("walks"), 2);
    }

    #[tokio::test]
    async fn test_lenient_policy_delivers_unparseable_body_as_text() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "walks", "silly.#");
        publish_raw(&broker, "silly.walk", b"not json").await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler = move |message: Message| {
            sink.lock().unwrap().push(message.body.clone());
            async { Err::<(), _>(HandlerError::Halt) }
        };

        let mut session = ConsumerSession::new(broker.consumer());
        session.run(handler, bindings()).await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![Value::String("not json".into())]);
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_and_keeps_consuming() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "walks", "silly.#");
        publish_raw(&broker, "silly.walk", b"not json").await;
        publish_raw(&broker, "silly.walk", b"[1, 2]").await;
        publish_raw(&broker, "silly.walk", br#"{"ok": true}"#).await;

        let handler = |message: Message| async move {
            assert_eq!(message.body, json!({"ok": true}));
            Err::<(), _>(HandlerError::Halt)
        };
        let mut session = ConsumerSession::new(broker.consumer()).with_decode_policy(DecodePolicy::Strict);
        session.run(handler, bindings()).await.unwrap();

        assert_eq!(broker.nacked(), vec![(1, false), (2, false), (3, true)]);
        assert!(broker.acked().is_empty());
    }

    #[tokio::test]
    async fn test_shared_queue_binds_every_key_but_consumes_once() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "walks", "seed");
        publish_raw(&broker, "seed", b"{}").await;

        let bindings = vec![
            Binding::new("amq.topic", "walks", "particularly.silly.#"),
            Binding::new("amq.topic", "walks", "rather.silly.#"),
        ];
        let handler = |_: Message| async { Err::<(), _>(HandlerError::Halt) };
        let mut session = ConsumerSession::new(broker.consumer()).with_prefetch_count(5);
        session.run(handler, bindings).await.unwrap();

        let operations = broker.operations();
        assert!(operations.contains(&"qos 5".to_string()));
        assert!(operations.contains(&"bind walks amq.topic particularly.silly.#".to_string()));
        assert!(operations.contains(&"bind walks amq.topic rather.silly.#".to_string()));
        assert_eq!(operations.iter().filter(|op| op.starts_with("consume ")).count(), 1);
    }

    #[tokio::test]
    async fn test_stop_from_handler_acks_then_closes() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "walks", "silly.#");
        for _ in 0..3 {
            publish_raw(&broker, "silly.walk", b"{}").await;
        }

        let mut session = ConsumerSession::new(broker.consumer());
        let control = session.control();
        let handler = move |_: Message| {
            let control = control.clone();
            async move {
                control.stop();
                Ok::<(), HandlerError>(())
            }
        };

        assert_eq!(session.run(handler, bindings()).await.unwrap(), SessionOutcome::Stopped);
        assert_eq!(broker.acked(), vec![1]);
        assert!(broker.nacked().is_empty());
        assert_eq!(broker.queue_depth("walks"), 2);
        assert_eq!(broker.open_connections(), 0);
        assert!(broker.operations().contains(&"close".to_string()));

        // Stopping sticks.
        let handler = |_: Message| async { Ok::<(), HandlerError>(()) };
        assert_eq!(session.run(handler, bindings()).await.unwrap(), SessionOutcome::Stopped);
        assert_eq!(broker.connection_attempts(), 1);
    }

    #[tokio::test]
    async fn test_stop_from_another_task_ends_consume() {
        let broker = MemoryBroker::new();
        let mut session = ConsumerSession::new(broker.consumer());
        let control = session.control();

        let watcher = broker.clone();
        tokio::spawn(async move {
            while watcher.consumer_count() == 0 {
                tokio::task::yield_now().await;
            }
            control.stop();
        });

        let handler = |_: Message| async { Ok::<(), HandlerError>(()) };
        session.consume(handler, bindings()).await.unwrap();
        assert_eq!(broker.consumer_count(), 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_paused_session_sets_up_topology_and_waits_for_resume() {
        let broker = MemoryBroker::new();
        broker.bind("amq.topic", "walks", "seed");
        publish_raw(&broker, "seed", b"{}").await;

        let mut session = ConsumerSession::new(broker.consumer());
        let control = session.control();
        control.pause();

        let stopper = control.clone();
        let handler = move |_: Message| {
            let stopper = stopper.clone();
            async move {
                stopper.stop();
                Ok::<(), HandlerError>(())
            }
        };
        let running = tokio::spawn(async move { session.run(handler, bindings()).await });

        let bound = "bind walks amq.topic silly.#".to_string();
        while !broker.operations().contains(&bound) {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert_eq!(broker.consumer_count(), 0);
        assert_eq!(broker.queue_depth("walks"), 1);

        control.resume();
        assert_eq!(running.await.unwrap().unwrap(), SessionOutcome::Stopped);
        assert_eq!(broker.acked(), vec![1]);
        assert_eq!(broker.queue_depth("walks"), 0);
    }

    #[tokio::test]
    async fn test_auto_delete_binding_reaches_the_broker() {
        let broker = MemoryBroker::new();
        let bindings = vec![Binding::new("amq.topic", "scratch", "silly.#").with_auto_delete(true)];
        let mut session = ConsumerSession::new(broker.consumer());
        let control = session.control();

        let watcher = broker.clone();
        tokio::spawn(async move {
            while watcher.consumer_count() == 0 {
                tokio::task::yield_now().await;
            }
            control.stop();
        });

        let handler = |_: Message| async { Ok::<(), HandlerError>(()) };
        session.run(handler, bindings).await.unwrap();

        assert!(broker.operations().contains(&"declare_queue scratch auto_delete".to_string()));
        // Cancelling its only consumer removed the queue.
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_ends_session() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(10);

        let handler = |_: Message| async { Ok::<(), HandlerError>(()) };
        let mut session = ConsumerSession::new(broker.consumer()).with_retry_policy(2, Duration::from_secs(60));

        assert_eq!(
            session.run(handler, bindings()).await.unwrap(),
            SessionOutcome::RetriesExhausted
        );
        assert_eq!(broker.connection_attempts(), 3);
    }
}
