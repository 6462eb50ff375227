//! Reply routing state shared by the read loop and the send path.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Cache of sender id → last channel the sender wrote from.
///
/// Entries are best-effort: last write wins and staleness is tolerated.
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Arc<Mutex<HashMap<String, String>>>,
}

impl RoutingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `sender_id` last wrote from `channel_id`.
    pub async fn set(&self, sender_id: &str, channel_id: &str) {
        let previous = self
            .routes
            .lock()
            .await
            .insert(sender_id.to_owned(), channel_id.to_owned());
        if previous.as_deref() != Some(channel_id) {
            debug!(sender_id, channel_id, "routing: route updated");
        }
    }

    /// Last known channel for `sender_id`.
    pub async fn get(&self, sender_id: &str) -> Option<String> {
        self.routes.lock().await.get(sender_id).cloned()
    }

    /// Drop every route.
    pub async fn clear(&self) {
        self.routes.lock().await.clear();
    }

    /// Number of known senders.
    pub async fn len(&self) -> usize {
        self.routes.lock().await.len()
    }

    /// Whether no sender is known.
    pub async fn is_empty(&self) -> bool {
        self.routes.lock().await.is_empty()
    }
}

/// Account the child is logged in as, reported once per session by `ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    /// Provider user id.
    pub user_id: String,
    /// Provider username.
    pub username: String,
}
