//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Bridge error enumeration covering every failure mode of the stdio bridge.
///
/// Only [`AppError::Config`] and [`AppError::Spawn`] are fatal, and only to
/// `start`. Everything else is recovered where it happens and logged.
#[derive(Debug)]
pub enum AppError {
    /// Missing or invalid configuration (token, script path, limits).
    Config(String),
    /// The child executable could not be launched.
    Spawn(String),
    /// A record from the child could not be framed or decoded.
    Decode(String),
    /// Writing a record to the child's stdin failed.
    Write(String),
    /// The child reported an application-level error.
    Upstream(String),
    /// The child exited or its output stream closed.
    Disconnected(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Write(msg) => write!(f, "write: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream: {msg}"),
            Self::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
