//! Bridge configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service the credential is stored under.
pub const KEYRING_SERVICE: &str = "stdio-bridge";

/// Keychain entry holding the child's credential.
pub const KEYRING_TOKEN_KEY: &str = "bridge_token";

/// Environment variable consulted when the keychain has no credential.
pub const TOKEN_ENV_VAR: &str = "BRIDGE_TOKEN";

/// Provider-imposed ceiling for a single outbound message.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2000;

fn default_name() -> String {
    "stdio_bridge".into()
}

fn default_true() -> bool {
    true
}

fn default_interpreter() -> String {
    "node".into()
}

fn default_max_message_len() -> usize {
    DEFAULT_MAX_MESSAGE_LEN
}

fn default_stop_timeout_seconds() -> u64 {
    5
}

fn default_event_buffer() -> usize {
    256
}

/// Bridge configuration parsed from `config.toml`.
///
/// The credential is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Channel name stamped on every inbound bus message.
    #[serde(default = "default_name")]
    pub name: String,
    /// Whether the host should start this channel at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path to the child client script.
    pub client_path: PathBuf,
    /// Program used to run `client_path`. Empty runs the script directly.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Sender identifiers allowed to reach the bus; empty allows everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Maximum characters per outbound `send` record.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    /// Grace period before a stopping child is killed.
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: u64,
    /// Capacity of the queue between the read loop and the dispatcher.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Credential passed to the child as its positional argument (populated at runtime).
    #[serde(skip)]
    pub token: String,
}

impl BridgeConfig {
    /// Build a configuration with defaults for everything except the script path.
    #[must_use]
    pub fn new(client_path: impl Into<PathBuf>) -> Self {
        Self {
            name: default_name(),
            enabled: true,
            client_path: client_path.into(),
            interpreter: default_interpreter(),
            allow_from: Vec::new(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            stop_timeout_seconds: default_stop_timeout_seconds(),
            event_buffer: default_event_buffer(),
            token: String::new(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate limits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the child credential from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither the keychain nor
    /// [`TOKEN_ENV_VAR`] provides a credential.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.token = load_credential(KEYRING_TOKEN_KEY, TOKEN_ENV_VAR).await?;
        Ok(())
    }

    /// Graceful termination window as a [`Duration`].
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.max_message_len == 0 {
            return Err(AppError::Config(
                "max_message_len must be greater than zero".into(),
            ));
        }

        if self.stop_timeout_seconds == 0 {
            return Err(AppError::Config(
                "stop_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(AppError::Config(
                "event_buffer must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
