//! Bridge channel, the public face of the stdio bridge.
//!
//! Composes the supervisor, read loop, codec and chunker into
//! `start` / `send` / `stop`, and dispatches decoded child events to the
//! host's [`MessageBus`].
//!
//! # Data flow
//!
//! 1. [`BridgeChannel::start`] validates configuration and spawns the child.
//! 2. The read loop decodes child records and queues them for a dispatcher
//!    task owned by the channel.
//! 3. The dispatcher stores the session identity on `ready`, updates the
//!    routing table and publishes to the bus on `message`, and reaps the
//!    child when its output closes.
//! 4. [`BridgeChannel::send`] chunks outbound text and writes one `send`
//!    record per chunk, holding a send lock so concurrent messages never
//!    interleave.
//! 5. [`BridgeChannel::stop`] shuts the child down and forgets routes and identity.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge::chunker::split_message;
use crate::bridge::gating::{composite_sender_id, is_allowed};
use crate::bridge::protocol::{ChatMessage, InboundEvent, OutboundCommand};
use crate::bridge::reader::StreamEvent;
use crate::bridge::routing::{RoutingTable, SessionIdentity};
use crate::bridge::supervisor::{join_tasks, LaunchSpec, ProcessState, ProcessSupervisor};
use crate::bus::{ChannelNotice, InboundMessage, MessageBus, MessageMetadata, OutboundMessage};
use crate::config::BridgeConfig;
use crate::{AppError, Result};

struct Inner {
    config: BridgeConfig,
    bus: Arc<dyn MessageBus>,
    supervisor: ProcessSupervisor,
    routes: RoutingTable,
    identity: Mutex<Option<SessionIdentity>>,
    /// Held for the whole of one outbound message.
    send_lock: Mutex<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Bidirectional bridge between a host bus and an NDJSON child process.
///
/// Cheap to clone; clones share the same child, routes and identity.
#[derive(Clone)]
pub struct BridgeChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BridgeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeChannel")
            .field("name", &self.inner.config.name)
            .field("state", &self.inner.supervisor.state())
            .finish_non_exhaustive()
    }
}

impl BridgeChannel {
    /// Create an inert channel; nothing is spawned until [`start`](Self::start).
    #[must_use]
    pub fn new(config: BridgeConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                supervisor: ProcessSupervisor::new(),
                routes: RoutingTable::new(),
                identity: Mutex::new(None),
                send_lock: Mutex::new(()),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Channel name from configuration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration the channel was built with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Current supervisor state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.inner.supervisor.state()
    }

    /// Watch supervisor state transitions, including unexpected exits.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.inner.supervisor.subscribe()
    }

    /// Whether the child is live.
    pub async fn is_running(&self) -> bool {
        self.inner.supervisor.is_running().await
    }

    /// Identity reported by the child's `ready`, once received.
    pub async fn identity(&self) -> Option<SessionIdentity> {
        self.inner.identity.lock().await.clone()
    }

    /// Last channel `sender_id` wrote from.
    ///
    /// Accepts either the raw id or the composite `id|name` form.
    pub async fn route_for(&self, sender_id: &str) -> Option<String> {
        self.inner.routes.get(raw_sender_id(sender_id)).await
    }

    /// Validate configuration, spawn the child and start dispatching.
    ///
    /// # Errors
    ///
    /// - [`AppError::Config`] when the credential is empty or the client
    ///   script is missing (or not executable when launched directly). No
    ///   process is spawned and the channel stays inert.
    /// - [`AppError::Spawn`] when the child cannot be launched or is already live.
    pub async fn start(&self) -> Result<()> {
        let launch = match validate_launch(&self.inner.config).await {
            Ok(launch) => launch,
            Err(err) => {
                error!(channel = %self.name(), %err, "channel inert: invalid configuration");
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(self.inner.config.event_buffer);
        self.inner.supervisor.start(&launch, tx).await?;
        self.spawn_dispatcher(rx).await;
        info!(channel = %self.name(), "bridge channel started");
        Ok(())
    }

    /// Run the bridge over an existing stream pair instead of spawning.
    ///
    /// `stdout` is what the child writes; `stdin` is where records for the
    /// child go. Configuration is not validated.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the channel is already running.
    pub async fn attach<R, W>(&self, stdout: R, stdin: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.inner.config.event_buffer);
        self.inner.supervisor.attach(stdout, stdin, tx).await?;
        self.spawn_dispatcher(rx).await;
        debug!(channel = %self.name(), "bridge channel attached");
        Ok(())
    }

    /// Deliver `content` to `destination_id`, split into provider-sized chunks.
    ///
    /// A no-op when the child is not running or either argument is empty.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Write`] when a chunk cannot be written. Chunks
    /// already written stay delivered and the remaining ones are abandoned;
    /// the channel stays usable for later sends.
    pub async fn send(&self, destination_id: &str, content: &str) -> Result<()> {
        self.inner.send(destination_id, content).await
    }

    /// Deliver a bus [`OutboundMessage`]; see [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        self.send(&message.destination_id, &message.content).await
    }

    /// Reply to `sender_id` in the channel it last wrote from.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Write`] when no route is known for the sender, or
    /// when delivery fails as in [`send`](Self::send).
    pub async fn send_to_sender(&self, sender_id: &str, content: &str) -> Result<()> {
        let Some(channel_id) = self.route_for(sender_id).await else {
            warn!(sender_id, "no known route for sender, dropping reply");
            return Err(AppError::Write(format!("no route for sender {sender_id}")));
        };
        self.send(&channel_id, content).await
    }

    /// Ask the child for a `pong`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Write`] when the child is not running or the
    /// write fails.
    pub async fn ping(&self) -> Result<()> {
        if !self.inner.supervisor.is_running().await {
            return Err(AppError::Write("child process not running".into()));
        }
        self.inner.supervisor.write(&OutboundCommand::Ping).await
    }

    /// Stop the child and forget routes and identity. Idempotent.
    ///
    /// Bounded by the configured stop timeout: the child and the dispatcher
    /// share one deadline, after which the child is killed and pending
    /// dispatch is abandoned.
    ///
    /// # Errors
    ///
    /// Propagates supervisor shutdown errors; none are currently produced.
    pub async fn stop(&self) -> Result<()> {
        let timeout = self.inner.config.stop_timeout();
        let deadline = Instant::now() + timeout;
        self.inner.supervisor.stop(timeout).await?;

        let dispatcher = self.inner.dispatcher.lock().await.take();
        if let Some(handle) = dispatcher {
            join_tasks(vec![handle], deadline).await;
            info!(channel = %self.name(), "bridge channel stopped");
        }

        self.inner.routes.clear().await;
        *self.inner.identity.lock().await = None;
        Ok(())
    }

    /// Apply one decoded child event, exactly as the dispatcher would.
    pub async fn dispatch(&self, event: InboundEvent) {
        self.inner.dispatch(event).await;
    }

    async fn spawn_dispatcher(&self, mut rx: mpsc::Receiver<StreamEvent>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    StreamEvent::Event(event) => inner.dispatch(event).await,
                    StreamEvent::Closed { reason } => inner.on_stream_closed(&reason).await,
                }
            }
        });

        if let Some(previous) = self.inner.dispatcher.lock().await.replace(handle) {
            previous.abort();
        }
    }
}

impl Inner {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::Ready { user_id, username } => self.on_ready(&user_id, &username).await,
            InboundEvent::Message(message) => self.on_message(message).await,
            InboundEvent::Error { message } => {
                error!(channel = %self.name(), message, "child reported error");
                self.bus
                    .notify(ChannelNotice::UpstreamError {
                        channel: self.config.name.clone(),
                        message,
                    })
                    .await;
            }
            InboundEvent::Disconnected => {
                warn!(channel = %self.name(), "child lost its provider connection");
                self.bus
                    .notify(ChannelNotice::Disconnected {
                        channel: self.config.name.clone(),
                        reason: "reported by child".into(),
                    })
                    .await;
            }
            InboundEvent::Starting => debug!(channel = %self.name(), "child starting"),
            InboundEvent::Sent {
                channel_id,
                success,
            } => {
                if success {
                    debug!(channel = %self.name(), channel_id, "child confirmed send");
                } else {
                    warn!(channel = %self.name(), channel_id, "child reported failed send");
                }
            }
            InboundEvent::Pong => debug!(channel = %self.name(), "pong"),
        }
    }

    async fn on_ready(&self, user_id: &str, username: &str) {
        {
            let mut identity = self.identity.lock().await;
            if let Some(existing) = identity.as_ref() {
                debug!(
                    channel = %self.name(),
                    username = existing.username,
                    "ready repeated, keeping session identity"
                );
                return;
            }
            *identity = Some(SessionIdentity {
                user_id: user_id.to_owned(),
                username: username.to_owned(),
            });
        }

        info!(channel = %self.name(), user_id, username, "child logged in");
        self.bus
            .notify(ChannelNotice::Ready {
                channel: self.config.name.clone(),
                user_id: user_id.to_owned(),
                username: username.to_owned(),
            })
            .await;
    }

    async fn on_message(&self, message: ChatMessage) {
        if message.channel_id.is_empty() || message.sender_id.is_empty() {
            debug!(channel = %self.name(), "dropping message without channel_id or sender_id");
            return;
        }

        self.routes
            .set(&message.sender_id, &message.channel_id)
            .await;

        let sender_id = composite_sender_id(&message.sender_id, &message.sender_name);
        if !is_allowed(&sender_id, &self.config.allow_from) {
            warn!(channel = %self.name(), sender_id, "sender not in allow_from, dropping message");
            return;
        }

        debug!(
            channel = %self.name(),
            sender_id,
            channel_id = message.channel_id,
            "forwarding message to bus"
        );

        let inbound = InboundMessage {
            channel: self.config.name.clone(),
            sender_id,
            chat_id: message.channel_id,
            content: message.content,
            metadata: MessageMetadata {
                message_id: message.message_id,
                is_dm: message.is_dm,
                is_group_dm: message.is_group_dm,
                sender_name: message.sender_name,
                timestamp: message.timestamp,
            },
            received_at: Utc::now(),
        };

        if let Err(err) = self.bus.publish_inbound(inbound).await {
            warn!(channel = %self.name(), %err, "failed to publish inbound message");
        }
    }

    async fn on_stream_closed(&self, reason: &str) {
        let Some(outcome) = self.supervisor.mark_exited().await else {
            debug!(channel = %self.name(), reason, "stream closed during shutdown");
            return;
        };

        warn!(channel = %self.name(), reason, outcome, "child process disconnected");
        self.bus
            .notify(ChannelNotice::Disconnected {
                channel: self.config.name.clone(),
                reason: format!("{reason}; {outcome}"),
            })
            .await;
    }

    async fn send(&self, destination_id: &str, content: &str) -> Result<()> {
        if destination_id.is_empty() || content.is_empty() {
            debug!(channel = %self.name(), "ignoring send with empty destination or content");
            return Ok(());
        }

        if !self.supervisor.is_running().await {
            warn!(channel = %self.name(), destination_id, "child process not running, dropping message");
            return Ok(());
        }

        if self.identity.lock().await.is_none() {
            debug!(channel = %self.name(), "sending before the child reported ready");
        }

        let chunks = split_message(content, self.config.max_message_len);
        let total = chunks.len();

        let _guard = self.send_lock.lock().await;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let command = OutboundCommand::Send {
                channel_id: destination_id.to_owned(),
                content: chunk,
            };
            if let Err(err) = self.supervisor.write(&command).await {
                warn!(
                    channel = %self.name(),
                    destination_id,
                    chunk = index + 1,
                    total,
                    %err,
                    "failed to deliver message chunk, abandoning the rest"
                );
                return Err(err);
            }
        }

        debug!(channel = %self.name(), destination_id, chunks = total, "message delivered to child");
        Ok(())
    }
}

/// Check what `start` needs before anything is spawned.
async fn validate_launch(config: &BridgeConfig) -> Result<LaunchSpec> {
    if config.token.trim().is_empty() {
        return Err(AppError::Config("credential is not configured".into()));
    }

    let path = &config.client_path;
    let metadata = tokio::fs::metadata(path).await.map_err(|err| {
        AppError::Config(format!("client script not found: {}: {err}", path.display()))
    })?;

    if !metadata.is_file() {
        return Err(AppError::Config(format!(
            "client script is not a file: {}",
            path.display()
        )));
    }

    if config.interpreter.is_empty() && !is_executable(&metadata) {
        return Err(AppError::Config(format!(
            "client script is not executable: {}",
            path.display()
        )));
    }

    Ok(LaunchSpec::from_config(config))
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

fn raw_sender_id(sender_id: &str) -> &str {
    sender_id
        .split_once('|')
        .map_or(sender_id, |(id, _)| id)
}
