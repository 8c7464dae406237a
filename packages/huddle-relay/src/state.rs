//! Server state management.
//!
//! Holds the signaling store, the connected clients, and the live
//! subscriptions each client has opened. Client and subscription maps are
//! concurrent (DashMap); the store serializes its own mutations.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use huddle_core::signaling::{CALLEE_CANDIDATES, CALLER_CANDIDATES};
use huddle_core::store::protocol::ServerMessage;
use huddle_core::store::{BatchOp, CollectionPath, MemoryStore, SignalingStore};

/// Default call session TTL in seconds (4 hours).
const DEFAULT_CALL_TTL_SECS: i64 = 4 * 3600;

/// Default cleanup interval in seconds (5 minutes).
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Sessions older than this are deleted with their candidates
    pub call_ttl_secs: i64,
    pub cleanup_interval_secs: u64,
    /// Collection holding call session documents
    pub sessions_collection: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            call_ttl_secs: DEFAULT_CALL_TTL_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            sessions_collection: huddle_core::config::DEFAULT_SESSIONS_COLLECTION.to_string(),
        }
    }
}

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// The signaling documents every client reads and writes.
    pub store: MemoryStore,

    /// Connection id → sender channel.
    pub clients: Arc<DashMap<String, ClientSender>>,

    /// (connection id, subscription id) → forwarding task.
    /// Aborting the task drops the store subscription.
    pub subscriptions: Arc<DashMap<(String, u64), AbortHandle>>,

    /// Server configuration.
    pub config: RelayConfig,
}

impl RelayState {
    /// Create a new relay state with an empty store.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            store: MemoryStore::new(),
            clients: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            config,
        }
    }

    // ── Client Management ─────────────────────────────────────────────────

    /// Register a connection and its sender channel.
    pub fn register_client(&self, connection_id: &str, sender: ClientSender) {
        tracing::info!(connection = connection_id, "Client connected");
        self.clients.insert(connection_id.to_string(), sender);
    }

    /// Forget a connection and stop every subscription it opened.
    pub fn unregister_client(&self, connection_id: &str) {
        self.clients.remove(connection_id);

        let mut stopped = 0usize;
        self.subscriptions.retain(|(connection, _), handle| {
            if connection == connection_id {
                handle.abort();
                stopped += 1;
                false
            } else {
                true
            }
        });
        tracing::info!(connection = connection_id, subscriptions = stopped, "Client disconnected");
    }

    /// Queue a message for a connection. Returns false if it is gone.
    pub fn send_to_client(&self, connection_id: &str, message: ServerMessage) -> bool {
        match self.clients.get(connection_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// A clone of a connection's sender.
    pub fn client_sender(&self, connection_id: &str) -> Option<ClientSender> {
        self.clients.get(connection_id).map(|s| s.clone())
    }

    /// Number of connected clients.
    pub fn online_count(&self) -> usize {
        self.clients.len()
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Remember the forwarding task behind a subscription.
    pub fn track_subscription(&self, connection_id: &str, subscription_id: u64, task: AbortHandle) {
        if let Some(previous) = self
            .subscriptions
            .insert((connection_id.to_string(), subscription_id), task)
        {
            previous.abort();
        }
    }

    /// Stop one subscription. Returns false if it was unknown.
    pub fn stop_subscription(&self, connection_id: &str, subscription_id: u64) -> bool {
        match self
            .subscriptions
            .remove(&(connection_id.to_string(), subscription_id))
        {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions across all clients.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    /// Delete call sessions older than the configured TTL, together with
    /// their candidate collections. Returns how many sessions were removed.
    ///
    /// Sessions without a `createdAt` field are left alone.
    pub async fn cleanup_expired_calls(&self) -> usize {
        let sessions = match CollectionPath::new(self.config.sessions_collection.as_str()) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(error = %e, "Invalid sessions collection");
                return 0;
            }
        };
        let entries = match self.store.list_collection(&sessions).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list call sessions");
                return 0;
            }
        };

        let cutoff = Utc::now().timestamp_millis() - self.config.call_ttl_secs * 1000;
        let mut removed = 0usize;

        for entry in entries {
            let Some(created_at) = entry.data.get("createdAt").and_then(|v| v.as_i64()) else {
                continue;
            };
            if created_at > cutoff {
                continue;
            }

            let session = sessions.doc(&entry.id);
            let mut ops = vec![BatchOp::Delete {
                path: session.clone(),
            }];
            for name in [CALLER_CANDIDATES, CALLEE_CANDIDATES] {
                for path in self.store.document_paths(&session.collection(name)) {
                    ops.push(BatchOp::Delete { path });
                }
            }

            match self.store.run_batch(ops).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(session = %session, error = %e, "Failed to delete expired call");
                }
            }
        }

        if removed > 0 {
            tracing::debug!(count = removed, "Cleaned up expired calls");
        }
        removed
    }
}
