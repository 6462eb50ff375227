//! Wire protocol spoken with the child over stdio.
//!
//! Every record is one JSON object of the form
//! `{"type": <discriminator>, "data": <payload>}`; `data` may be absent for
//! commands and events that carry nothing.
//!
//! # Child → host
//!
//! | `type`         | Maps to                          |
//! |----------------|----------------------------------|
//! | `ready`        | [`InboundEvent::Ready`]          |
//! | `message`      | [`InboundEvent::Message`]        |
//! | `error`        | [`InboundEvent::Error`]          |
//! | `disconnected` | [`InboundEvent::Disconnected`]   |
//! | `starting`     | [`InboundEvent::Starting`]       |
//! | `sent`         | [`InboundEvent::Sent`]           |
//! | `pong`         | [`InboundEvent::Pong`]           |
//! | *(any other)*  | Skipped; logged at `DEBUG`       |
//!
//! # Host → child
//!
//! `send`, `stop` and `ping`, see [`OutboundCommand`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{AppError, Result};

/// Top-level record envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    /// Discriminator; `type` on the wire.
    #[serde(rename = "type")]
    kind: String,
    /// Discriminator-specific payload.
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReadyParams {
    user_id: String,
    username: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorParams {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SentParams {
    channel_id: String,
    success: bool,
}

/// Payload of a `message` record.
///
/// Every field is optional on the wire and defaults to empty/false; the
/// channel decides what to do with incomplete messages.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatMessage {
    /// Channel the message was posted in; replies go here.
    pub channel_id: String,
    /// Provider id of the author.
    pub sender_id: String,
    /// Display name of the author.
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// Provider message id.
    pub message_id: String,
    /// Whether the channel is a direct message.
    pub is_dm: bool,
    /// Whether the direct message has several recipients.
    pub is_group_dm: bool,
    /// Provider timestamp (ISO 8601), when supplied.
    pub timestamp: Option<String>,
}

/// Event decoded from one child record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The child logged in.
    Ready {
        /// Provider user id of the session.
        user_id: String,
        /// Provider username of the session.
        username: String,
    },
    /// A chat message addressed to the session.
    Message(ChatMessage),
    /// The child hit an application-level error.
    Error {
        /// Error text.
        message: String,
    },
    /// The child lost its provider connection.
    Disconnected,
    /// The child started and is about to log in.
    Starting,
    /// The child acknowledged a `send`.
    Sent {
        /// Destination of the acknowledged send.
        channel_id: String,
        /// Whether the provider accepted it.
        success: bool,
    },
    /// Reply to a `ping`.
    Pong,
}

/// Command written to the child's stdin.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Post `content` to `channel_id`.
    Send {
        /// Destination channel.
        channel_id: String,
        /// One chunk of message text.
        content: String,
    },
    /// Ask the child to log out and exit.
    Stop,
    /// Health check; answered with `pong`.
    Ping,
}

/// Decode one record from the child.
///
/// # Return value
///
/// - `Ok(Some(event))` for a recognized record.
/// - `Ok(None)` for a blank line or an unknown `type` (logged at `DEBUG`).
///
/// # Errors
///
/// - [`AppError::Decode`]`("malformed json: …")` when the line is not a JSON
///   object with a `type` field.
/// - [`AppError::Decode`]`("invalid `…` payload: …")` when `data` has the
///   wrong shape for a recognized `type`.
pub fn decode_line(line: &str) -> Result<Option<InboundEvent>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| AppError::Decode(format!("malformed json: {e}")))?;

    let event = match envelope.kind.as_str() {
        "ready" => {
            let params: ReadyParams = payload("ready", envelope.data)?;
            InboundEvent::Ready {
                user_id: params.user_id,
                username: params.username,
            }
        }
        "message" => InboundEvent::Message(payload("message", envelope.data)?),
        "error" => {
            let params: ErrorParams = payload("error", envelope.data)?;
            InboundEvent::Error {
                message: params.message,
            }
        }
        "disconnected" => InboundEvent::Disconnected,
        "starting" => InboundEvent::Starting,
        "sent" => {
            let params: SentParams = payload("sent", envelope.data)?;
            InboundEvent::Sent {
                channel_id: params.channel_id,
                success: params.success,
            }
        }
        "pong" => InboundEvent::Pong,
        other => {
            debug!(kind = other, "protocol: skipping unknown record type");
            return Ok(None);
        }
    };

    Ok(Some(event))
}

/// Serialize a command into a single-line JSON record, without the trailing newline.
///
/// Newlines inside message text are escaped by the JSON encoder, so the
/// result never contains a raw `\n`.
///
/// # Errors
///
/// Returns [`AppError::Write`] if serialization fails.
pub fn encode_command(command: &OutboundCommand) -> Result<String> {
    serde_json::to_string(command)
        .map_err(|e| AppError::Write(format!("failed to serialise outbound command: {e}")))
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| AppError::Decode(format!("invalid `{kind}` payload: {e}")))
}
