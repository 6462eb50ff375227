//! Message bus boundary.
//!
//! The bridge never owns the host's message bus. It only needs somewhere to
//! publish normalized inbound chat messages and lifecycle notices, which is
//! what [`MessageBus`] describes. [`QueueBus`] is the in-process
//! implementation used by the binary and the tests.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{AppError, Result};

/// Boxed future returned by [`MessageBus`] methods.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Provider metadata carried alongside an inbound message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Provider message identifier.
    pub message_id: String,
    /// Whether the message arrived in a direct-message channel.
    pub is_dm: bool,
    /// Whether the direct-message channel has several recipients.
    #[serde(default)]
    pub is_group_dm: bool,
    /// Display name of the sender, possibly empty.
    pub sender_name: String,
    /// Provider timestamp, when the child supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A chat message normalized for the host bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    /// Name of the channel the message came through.
    pub channel: String,
    /// Composite `id|name` sender identifier, or the bare id without a name.
    pub sender_id: String,
    /// Destination to reply to.
    pub chat_id: String,
    /// Message text.
    pub content: String,
    /// Provider metadata.
    pub metadata: MessageMetadata,
    /// When the host decoded the message.
    pub received_at: DateTime<Utc>,
}

/// A message the host wants delivered through the child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination channel identifier.
    #[serde(alias = "chat_id")]
    pub destination_id: String,
    /// Message text; chunked before delivery.
    pub content: String,
}

impl OutboundMessage {
    /// Build an outbound message.
    #[must_use]
    pub fn new(destination_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            content: content.into(),
        }
    }
}

/// An outbound request as read from the host: an explicit destination, or a
/// reply to a sender's last known channel.
///
/// A request carrying both a destination and a `sender_id` is [`Direct`](Self::Direct).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutboundRequest {
    /// Deliver to the named destination.
    Direct(OutboundMessage),
    /// Deliver to wherever `sender_id` last wrote from.
    Reply {
        /// Raw or composite `id|name` sender identifier.
        sender_id: String,
        /// Message text; chunked before delivery.
        content: String,
    },
}

/// Lifecycle and observability notices surfaced to the bus owner.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelNotice {
    /// The child logged in and reported its session identity.
    Ready {
        /// Channel name.
        channel: String,
        /// Provider user id of the logged-in account.
        user_id: String,
        /// Provider username of the logged-in account.
        username: String,
    },
    /// The child reported an application-level error.
    UpstreamError {
        /// Channel name.
        channel: String,
        /// Error text from the child.
        message: String,
    },
    /// The child lost its provider connection or exited.
    Disconnected {
        /// Channel name.
        channel: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Host-side sink for everything the bridge produces.
pub trait MessageBus: Send + Sync {
    /// Publish a normalized inbound chat message.
    ///
    /// # Errors
    ///
    /// Implementations return an error when the message cannot be accepted;
    /// the bridge logs it and moves on.
    fn publish_inbound(&self, msg: InboundMessage) -> BusFuture<'_, Result<()>>;

    /// Surface a lifecycle notice. Ignored unless overridden.
    fn notify(&self, _notice: ChannelNotice) -> BusFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// [`MessageBus`] backed by bounded tokio channels.
#[derive(Debug, Clone)]
pub struct QueueBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    notice_tx: Option<mpsc::Sender<ChannelNotice>>,
}

impl QueueBus {
    /// Create a bus that only carries inbound messages.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound_tx,
                notice_tx: None,
            },
            inbound_rx,
        )
    }

    /// Create a bus that carries inbound messages and lifecycle notices.
    #[must_use]
    pub fn with_notices(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<InboundMessage>,
        mpsc::Receiver<ChannelNotice>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (notice_tx, notice_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound_tx,
                notice_tx: Some(notice_tx),
            },
            inbound_rx,
            notice_rx,
        )
    }
}

impl MessageBus for QueueBus {
    fn publish_inbound(&self, msg: InboundMessage) -> BusFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inbound_tx
                .send(msg)
                .await
                .map_err(|_| AppError::Disconnected("bus inbound receiver dropped".into()))
        })
    }

    fn notify(&self, notice: ChannelNotice) -> BusFuture<'_, ()> {
        Box::pin(async move {
            if let Some(tx) = &self.notice_tx {
                if tx.send(notice).await.is_err() {
                    debug!("queue bus: notice receiver dropped");
                }
            }
        })
    }
}
