#![forbid(unsafe_code)]

//! Bidirectional bridge between a host message bus and a child process that
//! speaks newline-delimited JSON over its stdio.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod errors;

pub use bridge::BridgeChannel;
pub use config::BridgeConfig;
pub use errors::{AppError, Result};
