//! Newline framing for the child's stdio.
//!
//! [`LineCodec`] turns the child's stdout byte stream into complete records
//! regardless of how the bytes are split across reads, and turns
//! [`OutboundCommand`]s into exactly one `\n`-terminated record each.
//!
//! A bad record (too long, or not UTF-8) is yielded as an `Err` *item* and
//! framing resumes at the next newline. Only a failed read surfaces as a
//! stream error, since `FramedRead` ends the stream after one.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use stdio_bridge::bridge::codec::LineCodec;
//!
//! let mut records = FramedRead::new(child_stdout, LineCodec::new());
//! while let Some(frame) = records.next().await {
//!     match frame? {
//!         Ok(line) => handle(line),
//!         Err(bad_record) => warn!(%bad_record, "skipping"),
//!     }
//! }
//! ```

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::bridge::protocol::{encode_command, OutboundCommand};
use crate::{AppError, Result};

/// Maximum inbound record length: 1 MiB.
///
/// A child that writes an oversized record gets that record rejected with
/// [`AppError::Decode`] instead of growing the buffer forever; the rest of
/// it is discarded up to the next newline.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One framed record, or the reason it was rejected.
pub type Frame = Result<String>;

/// Line framer for the bridge's NDJSON stdio.
///
/// Decoding yields one [`Frame`] per record: the record without its trailing
/// `\n` (a trailing `\r` is stripped too), or [`AppError::Decode`] for a
/// record that cannot be framed. Encoding serializes an [`OutboundCommand`]
/// and appends a single `\n`.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = AppError;

    /// Returns `Ok(None)` while `src` holds only a partial record.
    ///
    /// Never returns `Err`: read failures reach `FramedRead` through
    /// `From<io::Error>` without passing through here.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        Ok(into_frame(self.0.decode(src)))
    }

    /// Flushes a final unterminated record when the stream ends.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        Ok(into_frame(self.0.decode_eof(src)))
    }
}

impl Encoder<&OutboundCommand> for LineCodec {
    type Error = AppError;

    /// # Errors
    ///
    /// Returns [`AppError::Write`] if the command cannot be serialized.
    fn encode(&mut self, item: &OutboundCommand, dst: &mut BytesMut) -> Result<()> {
        let record = encode_command(item)?;
        dst.reserve(record.len() + 1);
        dst.put(record.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// `LinesCodec` has already consumed (or started discarding) the offending
/// record when it reports either error, so both are safe to skip.
fn into_frame(decoded: std::result::Result<Option<String>, LinesCodecError>) -> Option<Frame> {
    match decoded {
        Ok(line) => line.map(Ok),
        Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(AppError::Decode(format!(
            "line too long: exceeded {MAX_LINE_BYTES} bytes"
        )))),
        // The only I/O error LinesCodec raises itself is invalid UTF-8.
        Err(LinesCodecError::Io(io_err)) => {
            Some(Err(AppError::Decode(format!("invalid utf-8: {io_err}"))))
        }
    }
}
