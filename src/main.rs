#![forbid(unsafe_code)]

//! `stdio-bridge`: runs one bridge channel as a standalone relay.
//!
//! Inbound chat messages are written to stdout as JSON lines. Outbound
//! requests are read from stdin as JSON lines of the form
//! `{"destination_id": "...", "content": "..."}` (`chat_id` is accepted too)
//! or `{"sender_id": "...", "content": "..."}`. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use stdio_bridge::bridge::codec::LineCodec;
use stdio_bridge::bridge::supervisor::ProcessState;
use stdio_bridge::bus::{ChannelNotice, InboundMessage, OutboundRequest, QueueBus};
use stdio_bridge::{AppError, BridgeChannel, BridgeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stdio-bridge", about = "NDJSON stdio chat bridge", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("stdio-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = BridgeConfig::load_from_path(&args.config)?;
    if !config.enabled {
        info!(channel = %config.name, "channel disabled in configuration, exiting");
        return Ok(());
    }

    // A missing credential is reported by `start`, which keeps the channel inert.
    if let Err(err) = config.load_credentials().await {
        warn!(%err, "credential not loaded");
    }

    let (bus, inbound_rx, notice_rx) = QueueBus::with_notices(config.event_buffer);
    let channel = BridgeChannel::new(config, Arc::new(bus));
    channel.start().await?;

    let outcome = relay(&channel, inbound_rx, notice_rx).await;

    channel.stop().await?;
    info!("stdio-bridge shut down");
    outcome
}

async fn relay(
    channel: &BridgeChannel,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    notice_rx: mpsc::Receiver<ChannelNotice>,
) -> Result<()> {
    let mut host_lines = FramedRead::new(tokio::io::stdin(), LineCodec::new());
    let mut state_rx = channel.subscribe_state();

    // Inbound delivery runs on its own task so a send blocked on the child's
    // stdin never stops the bus from draining.
    let mut forwarder = tokio::spawn(forward_inbound(
        inbound_rx,
        notice_rx,
        tokio::io::stdout(),
    ));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received");
                break Ok(());
            }

            joined = &mut forwarder => {
                break joined.unwrap_or_else(|err| {
                    Err(AppError::Io(format!("inbound forwarder failed: {err}")))
                });
            }

            frame = host_lines.next() => match frame {
                None => {
                    info!("host stdin closed");
                    break Ok(());
                }
                Some(Ok(Ok(line))) => relay_outbound(channel, &line).await,
                Some(Ok(Err(err))) => warn!(%err, "unreadable host input line, skipping"),
                Some(Err(err)) => {
                    warn!(%err, "host stdin read failed, shutting down");
                    break Ok(());
                }
            },

            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow_and_update() == ProcessState::Stopped {
                    warn!("child process exited, shutting down");
                    break Ok(());
                }
            }
        }
    };

    forwarder.abort();
    outcome
}

/// Write inbound messages to `out` and log notices until both queues close.
async fn forward_inbound<W>(
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    mut notice_rx: mpsc::Receiver<ChannelNotice>,
    mut out: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            Some(msg) = inbound_rx.recv() => write_json_line(&mut out, &msg).await?,
            Some(notice) = notice_rx.recv() => info!(?notice, "channel notice"),
            else => return Ok(()),
        }
    }
}

async fn relay_outbound(channel: &BridgeChannel, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    let request: OutboundRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "host input is not a valid outbound request, skipping");
            return;
        }
    };

    let result = match &request {
        OutboundRequest::Direct(message) => channel.send_message(message).await,
        OutboundRequest::Reply { sender_id, content } => {
            channel.send_to_sender(sender_id, content).await
        }
    };

    if let Err(err) = result {
        warn!(%err, "outbound message not fully delivered");
    }
}

async fn write_json_line<W>(out: &mut W, msg: &InboundMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(msg)
        .map_err(|err| AppError::Io(format!("failed to serialise inbound message: {err}")))?;
    bytes.push(b'\n');
    out.write_all(&bytes)
        .await
        .map_err(|err| AppError::Io(format!("stdout write failed: {err}")))?;
    out.flush()
        .await
        .map_err(|err| AppError::Io(format!("stdout flush failed: {err}")))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the NDJSON relay stream.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
