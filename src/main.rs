use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

use fedora_messaging::rabbitmq::consumer::ConsumerSession;
use fedora_messaging::{Binding, HandlerError, Message, PublisherSession, SessionOutcome, Settings};

#[derive(Parser)]
#[command(name = "fedora-messaging")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish and consume Fedora messages over AMQP", long_about = None)]
struct Cli {
    /// Configuration file to use instead of the usual locations
    #[arg(short, long, global = true, env = "FEDORA_MESSAGING_CONF")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single message and wait for the broker to confirm it
    Publish {
        /// Routing key of the message
        topic: String,
        /// Message body, as JSON
        body: String,
        /// Exchange to publish to (defaults to publish_exchange)
        #[arg(long)]
        exchange: Option<String>,
        /// Broker URL (defaults to amqp_url)
        #[arg(long)]
        amqp_url: Option<String>,
    },
    /// Consume messages and log them
    Consume {
        /// Stop after this many messages
        #[arg(long)]
        halt_after: Option<usize>,
        /// Queue to consume from; requires at least one --routing-key
        #[arg(long, requires = "routing_keys")]
        queue: Option<String>,
        /// Exchange the queue is bound to
        #[arg(long, default_value = "amq.topic")]
        exchange: String,
        /// Routing key to bind the queue with (repeatable)
        #[arg(long = "routing-key", requires = "queue")]
        routing_keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise log at info until the configured filter is known.
    let from_env = EnvFilter::try_from_default_env().ok();
    let follow_config = from_env.is_none();
    let (filter, filter_handle) = reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    let settings = Settings::load(cli.config.as_deref())?;
    if follow_config {
        filter_handle
            .reload(EnvFilter::new(&settings.log_filter))
            .context("Failed to apply log_filter")?;
    }

    match cli.command {
        Commands::Publish {
            topic,
            body,
            exchange,
            amqp_url,
        } => publish(&settings, topic, &body, exchange.as_deref(), amqp_url.as_deref()).await,
        Commands::Consume {
            halt_after,
            queue,
            exchange,
            routing_keys,
        } => {
            let bindings = match queue {
                Some(queue) => routing_keys
                    .iter()
                    .map(|key| Binding::new(exchange.as_str(), queue.as_str(), key.as_str()))
                    .collect(),
                None => settings.bindings.clone(),
            };
            consume(&settings, bindings, halt_after).await
        }
    }
}

async fn publish(
    settings: &Settings,
    topic: String,
    body: &str,
    exchange: Option<&str>,
    amqp_url: Option<&str>,
) -> Result<()> {
    let body: Value = serde_json::from_str(body).context("Message body must be valid JSON")?;
    let mut message = Message::new(topic, body);

    let mut publisher = PublisherSession::open(settings, amqp_url, exchange, settings.confirms).await?;
    publisher.publish(&mut message).await?;
    publisher.close().await?;

    info!(topic = %message.topic, "Message published");
    Ok(())
}

async fn consume(settings: &Settings, bindings: Vec<Binding>, halt_after: Option<usize>) -> Result<()> {
    let mut session = ConsumerSession::from_settings(settings);
    let control = session.control();

    let interrupt = control.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                interrupt.stop();
            }
            Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
        }
    });

    // The message that reaches --halt-after is acknowledged before stopping.
    let received = Arc::new(AtomicUsize::new(0));
    let handler = move |message: Message| {
        let received = received.clone();
        let control = control.clone();
        async move {
            let count = received.fetch_add(1, Ordering::SeqCst) + 1;
            info!(count, topic = %message.topic, body = %message.body, "Received message");
            if halt_after.is_some_and(|limit| count >= limit) {
                control.stop();
            }
            Ok::<(), HandlerError>(())
        }
    };

    let outcome = session.run(handler, bindings).await?;
    info!(?outcome, "Consumer finished");
    if outcome == SessionOutcome::RetriesExhausted {
        anyhow::bail!("Gave up reconnecting to the broker");
    }
    Ok(())
}
