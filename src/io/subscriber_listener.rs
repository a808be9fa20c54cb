//! TCP subscriber listener
//!
//! Line protocol, one command per line:
//! - `SUB [last_seen]` - start (or restart) the live stream after `last_seen`
//! - `ACK <seq>` - acknowledge processing up to `seq`
//! - `QUERY <from_ms> <to_ms>` - aggregate buckets overlapping the range
//! - `UNSUB` - stop the live stream
//!
//! Every server line is a JSON object tagged by `type`: `event`, `caught_up`,
//! `aggregate`, `gap`, `buckets`, `error` or `closed`.

use crate::domain::types::Seq;
use crate::services::aggregator::AggregateBucket;
use crate::services::dispatcher::{Delivery, Subscription};
use crate::services::engine::Engine;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe { last_seen: Option<Seq> },
    Ack { seq: Seq },
    Query { from: u64, to: u64 },
    Unsubscribe,
}

impl ClientCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
        let args: Vec<&str> = parts.collect();

        let number = |s: &str| s.parse::<u64>().map_err(|_| format!("invalid number: {s}"));

        match (verb.to_ascii_uppercase().as_str(), args.as_slice()) {
            ("SUB", []) => Ok(Self::Subscribe { last_seen: None }),
            ("SUB", [seq]) => Ok(Self::Subscribe { last_seen: Some(Seq(number(*seq)?)) }),
            ("ACK", [seq]) => Ok(Self::Ack { seq: Seq(number(*seq)?) }),
            ("QUERY", [from, to]) => Ok(Self::Query { from: number(*from)?, to: number(*to)? }),
            ("UNSUB", []) => Ok(Self::Unsubscribe),
            ("SUB" | "ACK" | "QUERY" | "UNSUB", _) => Err(format!("wrong arguments for {verb}")),
            _ => Err(format!("unknown command: {verb}")),
        }
    }
}

/// Lines that are not stream deliveries
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlLine<'a> {
    Buckets { from: u64, to: u64, buckets: &'a [AggregateBucket] },
    Error { message: &'a str },
    Closed { reason: &'a str },
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

/// Next delivery, or never while unsubscribed
async fn next_delivery(sub: &mut Option<Subscription>) -> Option<Delivery> {
    match sub {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

/// Bind the listener and serve connections until shutdown
pub async fn start_subscriber_listener(
    port: u16,
    engine: Arc<Engine>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "subscriber_listener_started");
    serve(listener, engine, shutdown).await;
    Ok(())
}

/// Accept loop over an already bound listener
pub async fn serve(listener: TcpListener, engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("subscriber_listener_shutdown");
                    return;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let engine = engine.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, addr, engine, shutdown).await {
                                debug!(peer = %addr, error = %e, "subscriber_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "subscriber_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    debug!(peer = %addr, "subscriber_connection_accepted");
    let label = format!("tcp:{addr}");
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut sub: Option<Subscription> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match ClientCommand::parse(line) {
                    Ok(ClientCommand::Subscribe { last_seen }) => {
                        // Replacing drops (and unsubscribes) the previous stream
                        sub = Some(engine.subscribe(last_seen, &label));
                    }
                    Ok(ClientCommand::Ack { seq }) => match &sub {
                        Some(s) => s.ack(seq),
                        None => {
                            write_json(&mut writer, &ControlLine::Error { message: "not subscribed" }).await?;
                        }
                    },
                    Ok(ClientCommand::Query { from, to }) => {
                        let buckets = engine.query(from, to);
                        write_json(&mut writer, &ControlLine::Buckets { from, to, buckets: &buckets }).await?;
                    }
                    Ok(ClientCommand::Unsubscribe) => {
                        if sub.take().is_some() {
                            write_json(&mut writer, &ControlLine::Closed { reason: "unsubscribed" }).await?;
                        }
                    }
                    Err(message) => {
                        write_json(&mut writer, &ControlLine::Error { message: &message }).await?;
                    }
                }
            }
            delivery = next_delivery(&mut sub) => {
                match delivery {
                    Some(delivery) => write_json(&mut writer, &delivery).await?,
                    None => {
                        // Dispatcher closed us after the drain grace period
                        sub = None;
                        write_json(&mut writer, &ControlLine::Closed { reason: "overflow" }).await?;
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    write_json(&mut writer, &ControlLine::Closed { reason: "shutdown" }).await?;
                    break;
                }
            }
        }
    }

    writer.flush().await?;
    debug!(peer = %addr, "subscriber_connection_closed");
    Ok(())
}
