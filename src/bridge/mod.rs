//! Stdio bridge to a long-lived NDJSON child process.
//!
//! Submodules, leaves first:
//! - `codec`: [`LineCodec`](codec::LineCodec) newline framing for the child's stdio.
//! - `protocol`: `type`/`data` envelope decoding into
//!   [`InboundEvent`](protocol::InboundEvent) and command encoding.
//! - `chunker`: splitting outbound text under the provider's size limit.
//! - `reader`: the read loop task over the child's stdout and stderr.
//! - `supervisor`: spawn, write, and stop of the child process.
//! - `routing`: sender → channel reply cache and session identity.
//! - `gating`: sender allow-listing.
//! - `channel`: [`BridgeChannel`](channel::BridgeChannel), the public contract.

pub mod channel;
pub mod chunker;
pub mod codec;
pub mod gating;
pub mod protocol;
pub mod reader;
pub mod routing;
pub mod supervisor;

pub use channel::BridgeChannel;
