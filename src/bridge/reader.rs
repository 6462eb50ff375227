//! Read loop over the child's output streams.
//!
//! [`run_reader`] frames the child's stdout with [`LineCodec`], decodes each
//! record with [`decode_line`], and forwards the result through a tokio
//! [`mpsc`] channel to the dispatcher. Nothing in the loop blocks except the
//! read itself. [`run_stderr_logger`] drains stderr into the log so the child
//! can never stall on a full pipe.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::{decode_line, InboundEvent};
use crate::Result;

/// Item delivered from the read loop to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A decoded record.
    Event(InboundEvent),
    /// The output stream ended; no further events follow.
    Closed {
        /// Human-readable reason (`stream closed` or `stream error: …`).
        reason: String,
    },
}

/// Read loop: frames `stdout`, decodes records, and emits [`StreamEvent`]s.
///
/// Malformed, oversized, non-UTF-8 and unknown records are logged and
/// skipped; they never end the loop. The loop ends when:
///
/// - the stream reaches EOF: emits `Closed { reason: "stream closed" }`,
/// - a read fails: emits `Closed { reason: "stream error: …" }` once, with no retry,
/// - `cancel` fires: exits without emitting anything,
/// - `event_tx` is closed.
///
/// # Errors
///
/// Always returns `Ok(())`; failures are reported through `event_tx`.
pub async fn run_reader<R>(
    session_id: String,
    stdout: R,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, LineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "bridge reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(session_id, "bridge reader: EOF detected");
                        send_closed(&event_tx, &session_id, "stream closed".to_owned()).await;
                        break;
                    }

                    Some(Ok(Err(e))) => {
                        warn!(session_id, error = %e, "bridge reader: unframeable record, skipping");
                    }

                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "bridge reader: IO error, stopping");
                        send_closed(&event_tx, &session_id, format!("stream error: {e}")).await;
                        break;
                    }

                    Some(Ok(Ok(line))) => match decode_line(&line) {
                        Ok(Some(event)) => {
                            // A full queue must not outlive cancellation.
                            tokio::select! {
                                biased;

                                () = cancel.cancelled() => {
                                    debug!(session_id, "bridge reader: cancelled while queueing, stopping");
                                    break;
                                }

                                sent = event_tx.send(StreamEvent::Event(event)) => {
                                    if sent.is_err() {
                                        debug!(session_id, "bridge reader: event_tx closed, stopping");
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                session_id,
                                error = %e,
                                raw_line = %truncate(&line, 100),
                                "bridge reader: undecodable record, skipping"
                            );
                        }
                    },
                }
            }
        }
    }

    Ok(())
}

/// Drain the child's stderr into the log, one line per entry.
///
/// The content is never interpreted. Returns when the stream ends, a read
/// fails, or `cancel` fires.
pub async fn run_stderr_logger<R>(session_id: String, stderr: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stderr, LineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = framed.next() => match item {
                None => break,
                Some(Ok(Ok(line))) => {
                    if !line.trim().is_empty() {
                        info!(session_id, line = %line, "child stderr");
                    }
                }
                Some(Ok(Err(e))) => {
                    warn!(session_id, error = %e, "child stderr: unframeable line, skipping");
                }
                Some(Err(e)) => {
                    debug!(session_id, error = %e, "child stderr: read failed, stopping");
                    break;
                }
            },
        }
    }
}

async fn send_closed(event_tx: &mpsc::Sender<StreamEvent>, session_id: &str, reason: String) {
    if event_tx.send(StreamEvent::Closed { reason }).await.is_err() {
        debug!(
            session_id,
            "bridge reader: event_tx closed before Closed could be delivered"
        );
    }
}

fn truncate(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}
