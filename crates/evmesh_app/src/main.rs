//! Demo CLI: publish heartbeats into a session, or sit on a session and
//! print what arrives.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use evmesh::{EventId, Publisher, ReceiverGroup, Subscriber, Uri, SESSION_DEFAULT};

/// Default event exchanged by the demo.
const HEARTBEAT: EventId = EventId::from_u128(0x4845_4152_5442_4541_5400_0000_0000_0001);

#[derive(Parser)]
#[command(name = "evmesh", about = "Session-scoped LAN event fabric demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish heartbeat events into a session.
    Publish {
        /// Bind URI, e.g. `tcp://*:0` or `127.0.0.1:9000`.
        #[arg(long, default_value = "")]
        uri: String,
        #[arg(long, default_value = SESSION_DEFAULT)]
        session: String,
        /// Event identifier as hex; defaults to the demo heartbeat.
        #[arg(long)]
        event: Option<String>,
        /// Number of events to publish.
        #[arg(long, default_value_t = 10)]
        count: u32,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Subscribe to a session (or a concrete publisher URI) and log events.
    Subscribe {
        /// Publisher URI; fully qualified skips discovery.
        #[arg(long, default_value = "")]
        uri: String,
        #[arg(long, default_value = SESSION_DEFAULT)]
        session: String,
        #[arg(long)]
        event: Option<String>,
        /// Stop after this many events; 0 keeps listening.
        #[arg(long, default_value_t = 0)]
        count: u64,
    },
}

fn parse_event(event: &Option<String>) -> Result<EventId> {
    match event {
        Some(hex) => {
            let digits = hex.trim_start_matches("0x");
            let value = u128::from_str_radix(digits, 16)
                .with_context(|| format!("parse event id '{hex}'"))?;
            Ok(EventId::from_u128(value))
        }
        None => Ok(HEARTBEAT),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Publish {
            uri,
            session,
            event,
            count,
            interval_ms,
        } => publish(&uri, &session, &event, count, interval_ms),
        Command::Subscribe {
            uri,
            session,
            event,
            count,
        } => subscribe(&uri, &session, &event, count),
    }
}

fn publish(uri: &str, session: &str, event: &Option<String>, count: u32, interval_ms: u64) -> Result<()> {
    let uri: Uri = uri.parse()?;
    let event = parse_event(event)?;
    let publisher = Publisher::new(uri, session)?;

    tracing::info!(uri = %publisher.uri(), session = publisher.session(), "publishing");

    for i in 0..count {
        let payload = format!("beat {i}");
        if !publisher.publish_payload(event, payload.as_bytes()) {
            tracing::warn!(i, "publish failed");
        }
        std::thread::sleep(Duration::from_millis(interval_ms));
    }
    Ok(())
}

fn subscribe(uri: &str, session: &str, event: &Option<String>, count: u64) -> Result<()> {
    let uri: Uri = uri.parse()?;
    let event = parse_event(event)?;

    let group = ReceiverGroup::new();
    let subscriber = Subscriber::with_hint(&group, &uri, session)?;

    let seen = Rc::new(Cell::new(0u64));
    {
        let seen = seen.clone();
        subscriber.subscribe_payload(event, move |payload| {
            seen.set(seen.get() + 1);
            tracing::info!(
                n = seen.get(),
                payload = %String::from_utf8_lossy(payload),
                "event received"
            );
        });
    }

    tracing::info!(session = subscriber.session(), %event, "listening");

    while count == 0 || seen.get() < count {
        group.receive(Some(Duration::from_millis(1000)))?;
    }
    Ok(())
}
