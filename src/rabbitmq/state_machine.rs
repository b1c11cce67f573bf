// src/rabbitmq/state_machine.rs
// Connection lifecycle of the consuming session, free of any I/O. The driver
// in `consumer` feeds it events and executes the commands it returns.

use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::amqp_client::{BrokerEvent, InboundDelivery};
use super::backoff::Backoff;
use super::binding::Binding;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ChannelOpening,
    ChannelOpen,
    Consuming,
    Closing,
}

/// Why a session stopped for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The handler asked for (or caused) consumption to stop.
    Halted,
    /// The reconnect budget ran out while disconnected.
    RetriesExhausted,
    /// Stopped from outside through a [`ConsumerControl`](super::consumer::ConsumerControl).
    Stopped,
}

#[derive(Debug, PartialEq)]
pub enum Event {
    Start,
    ReconnectDue,
    /// Cancel every consumer but keep the connection and channel.
    Pause,
    Resume,
    /// Cancel every consumer and close the connection for good.
    Stop,
    Connection { epoch: u64, notice: Notice },
}

/// Completion of a command, or an unsolicited broker event, for one connection.
#[derive(Debug, PartialEq)]
pub enum Notice {
    Opened,
    OpenFailed(String),
    ChannelOpened,
    QosOk,
    ExchangeDeclared(usize),
    QueueDeclared { binding: usize, queue: String },
    QueueBound(usize),
    ConsumeStarted { queue: String, consumer_tag: String },
    OperationFailed { connection_lost: bool, reason: String },
    Broker(BrokerEvent),
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Connect { epoch: u64 },
    OpenChannel,
    SetQos(u16),
    DeclareExchange(usize),
    DeclareQueue(usize),
    BindQueue(usize),
    StartConsuming { queue: String },
    ScheduleReconnect(Duration),
    Process(InboundDelivery),
    Cancel(String),
    Close,
}

pub struct ConsumerStateMachine {
    state: ConnectionState,
    epoch: u64,
    backoff: Backoff,
    bindings: Vec<Binding>,
    prefetch_count: u16,
    consumer_tags: Vec<String>,
    bound_queues: HashSet<String>,
    consuming_queues: HashSet<String>,
    paused: bool,
    outcome: Option<SessionOutcome>,
}

impl ConsumerStateMachine {
    pub fn new(bindings: Vec<Binding>, backoff: Backoff, prefetch_count: u16) -> Self {
        ConsumerStateMachine {
            state: ConnectionState::Disconnected,
            epoch: 0,
            backoff,
            bindings,
            prefetch_count,
            consumer_tags: Vec::new(),
            bound_queues: HashSet::new(),
            consuming_queues: HashSet::new(),
            paused: false,
            outcome: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn consumer_tags(&self) -> &[String] {
        &self.consumer_tags
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        match event {
            Event::Start | Event::ReconnectDue => self.connect(),
            Event::Pause => self.pause(),
            Event::Resume => self.resume(),
            Event::Stop => self.shut_down(SessionOutcome::Stopped),
            Event::Connection { epoch, notice } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "Ignoring event from a previous connection");
                    return Vec::new();
                }
                if matches!(self.outcome, Some(SessionOutcome::Halted | SessionOutcome::Stopped)) {
                    debug!("Ignoring event, consumer is halting");
                    return Vec::new();
                }
                self.on_notice(notice)
            }
        }
    }

    /// Stops consumption: cancels every consumer and closes the connection.
    /// The session does not reconnect afterwards.
    pub fn request_halt(&mut self) -> Vec<Command> {
        self.shut_down(SessionOutcome::Halted)
    }

    fn shut_down(&mut self, outcome: SessionOutcome) -> Vec<Command> {
        if self.outcome.is_some() {
            return Vec::new();
        }
        info!(consumer_tags = ?self.consumer_tags, ?outcome, "Halting consumer sessions");
        self.outcome = Some(outcome);
        self.state = ConnectionState::Closing;

        let mut commands: Vec<Command> = self.consumer_tags.drain(..).map(Command::Cancel).collect();
        commands.push(Command::Close);
        commands
    }

    /// Called by the driver once the connection has been closed on our side.
    pub fn finish_close(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.forget_consumers();
    }

    fn pause(&mut self) -> Vec<Command> {
        if self.outcome.is_some() || self.paused {
            return Vec::new();
        }
        self.paused = true;
        if self.state == ConnectionState::Consuming {
            self.state = ConnectionState::ChannelOpen;
        }
        self.consuming_queues.clear();
        info!(consumer_tags = ?self.consumer_tags, "Pausing consumption");
        self.consumer_tags.drain(..).map(Command::Cancel).collect()
    }

    fn resume(&mut self) -> Vec<Command> {
        if self.outcome.is_some() || !self.paused {
            return Vec::new();
        }
        self.paused = false;
        info!("Resuming consumption");
        // Queues bound on the current channel start again; the rest start once topology is set up.
        let queues: Vec<String> = self
            .bindings
            .iter()
            .map(|b| b.queue_name.clone())
            .filter(|queue| self.bound_queues.contains(queue))
            .collect();
        queues
            .into_iter()
            .filter(|queue| self.consuming_queues.insert(queue.clone()))
            .map(|queue| Command::StartConsuming { queue })
            .collect()
    }

    fn forget_consumers(&mut self) {
        self.consumer_tags.clear();
        self.bound_queues.clear();
        self.consuming_queues.clear();
    }

    fn connect(&mut self) -> Vec<Command> {
        if self.outcome.is_some() || self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "Not connecting");
            return Vec::new();
        }
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.forget_consumers();
        vec![Command::Connect { epoch: self.epoch }]
    }

    fn on_notice(&mut self, notice: Notice) -> Vec<Command> {
        match notice {
            Notice::Opened => {
                info!("Successfully opened connection");
                self.backoff.reset();
                self.state = ConnectionState::ChannelOpening;
                vec![Command::OpenChannel]
            }
            Notice::OpenFailed(reason) => {
                error!(%reason, "Failed to open connection");
                self.state = ConnectionState::Disconnected;
                self.reconnect()
            }
            Notice::ChannelOpened => {
                self.state = ConnectionState::ChannelOpen;
                vec![Command::SetQos(self.prefetch_count)]
            }
            Notice::QosOk => (0..self.bindings.len()).map(Command::DeclareExchange).collect(),
            Notice::ExchangeDeclared(binding) => vec![Command::DeclareQueue(binding)],
            Notice::QueueDeclared { binding, queue } => match self.bindings.get(binding) {
                Some(b) if b.queue_name == queue => vec![Command::BindQueue(binding)],
                _ => {
                    warn!(%queue, binding, "Declared queue does not match its binding");
                    Vec::new()
                }
            },
            Notice::QueueBound(binding) => {
                let Some(queue) = self.bindings.get(binding).map(|b| b.queue_name.clone()) else {
                    return Vec::new();
                };
                self.bound_queues.insert(queue.clone());
                if !self.paused && self.consuming_queues.insert(queue.clone()) {
                    vec![Command::StartConsuming { queue }]
                } else {
                    Vec::new()
                }
            }
            Notice::ConsumeStarted { queue, consumer_tag } => {
                info!(%queue, %consumer_tag, "Consuming from queue");
                self.consumer_tags.push(consumer_tag);
                self.state = ConnectionState::Consuming;
                Vec::new()
            }
            Notice::OperationFailed { connection_lost: true, reason } => self.connection_lost(reason),
            Notice::OperationFailed { connection_lost: false, reason } => self.channel_closed(reason),
            Notice::Broker(event) => self.on_broker_event(event),
        }
    }

    fn on_broker_event(&mut self, event: BrokerEvent) -> Vec<Command> {
        match event {
            BrokerEvent::Delivery(delivery) => {
                // Deliveries prefetched before a pause are still handled.
                let paused_on_channel = self.paused && self.state == ConnectionState::ChannelOpen;
                if self.state == ConnectionState::Consuming || paused_on_channel {
                    vec![Command::Process(delivery)]
                } else {
                    debug!(delivery_tag = delivery.delivery_tag, state = ?self.state, "Dropping delivery, not consuming");
                    Vec::new()
                }
            }
            BrokerEvent::ConsumerCancelled(consumer_tag) => {
                // Observed only: the channel stays open and nothing reconnects.
                info!(%consumer_tag, "Server canceled consumer");
                self.consumer_tags.retain(|tag| tag != &consumer_tag);
                Vec::new()
            }
            BrokerEvent::ChannelClosed(reason) => self.channel_closed(reason),
            BrokerEvent::ConnectionClosed(reason) => self.connection_lost(reason),
        }
    }

    fn channel_closed(&mut self, reason: String) -> Vec<Command> {
        info!(%reason, "Channel closed");
        if matches!(
            self.state,
            ConnectionState::ChannelOpening | ConnectionState::ChannelOpen | ConnectionState::Consuming
        ) {
            self.state = ConnectionState::Connected;
        }
        self.forget_consumers();
        Vec::new()
    }

    fn connection_lost(&mut self, reason: String) -> Vec<Command> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        warn!(%reason, "Connection closed");
        self.state = ConnectionState::Disconnected;
        self.forget_consumers();
        self.reconnect()
    }

    fn reconnect(&mut self) -> Vec<Command> {
        match self.backoff.next_delay() {
            Some(delay) => {
                info!("Reconnecting in {} seconds", delay.as_secs());
                vec![Command::ScheduleReconnect(delay)]
            }
            None => {
                error!("Reconnect attempts exhausted, giving up");
                self.outcome = Some(SessionOutcome::RetriesExhausted);
                Vec::new()
            }
        }
    }
}
