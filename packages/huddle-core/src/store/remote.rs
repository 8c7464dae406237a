//! # Relay Store Client
//!
//! [`SignalingStore`] over a WebSocket connection to a `huddle-relay` server.
//!
//! ```text
//! ┌──────────────┐  ClientMessage (JSON)   ┌──────────────┐
//! │ RemoteStore  │ ──────────────────────► │ huddle-relay │
//! │              │ ◄────────────────────── │ (MemoryStore)│
//! └──────────────┘  ServerMessage (JSON)   └──────────────┘
//!        │
//!        ├── writer task: outbound queue → socket
//!        └── reader task: socket → pending requests / subscription sinks
//! ```
//!
//! Requests are correlated by id. Subscriptions are registered locally before
//! the subscribe request is sent, so the relay's initial snapshot can never
//! arrive before there is somewhere to put it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::protocol::{ClientMessage, ServerMessage, StoreOp, StoreReply};
use super::{
    BatchOp, CollectionEntry, CollectionPath, Document, DocumentPath, SignalingStore,
    Subscription,
};
use crate::error::{Error, Result};
use crate::runtime;

/// How long a request may wait for its response.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

enum SubscriptionSink {
    Document(mpsc::UnboundedSender<Option<Document>>),
    Collection(mpsc::UnboundedSender<CollectionEntry>),
}

struct RemoteInner {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<StoreReply>>>>,
    sinks: Mutex<HashMap<u64, SubscriptionSink>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl RemoteInner {
    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Response { id, reply } => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(Ok(reply));
                }
            }
            ServerMessage::Failed { id, code, message } => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(Err(Error::from_code(code, message)));
                }
            }
            ServerMessage::DocumentSnapshot {
                subscription_id,
                document,
            } => {
                let mut sinks = self.sinks.lock();
                if let Some(SubscriptionSink::Document(tx)) = sinks.get(&subscription_id) {
                    if tx.send(document).is_err() {
                        sinks.remove(&subscription_id);
                    }
                }
            }
            ServerMessage::CollectionAdded {
                subscription_id,
                entry,
            } => {
                let mut sinks = self.sinks.lock();
                if let Some(SubscriptionSink::Collection(tx)) = sinks.get(&subscription_id) {
                    if tx.send(entry).is_err() {
                        sinks.remove(&subscription_id);
                    }
                }
            }
            ServerMessage::Pong => {
                tracing::trace!("Relay pong");
            }
            ServerMessage::Error { message } => {
                tracing::warn!(error = message.as_str(), "Relay reported an error");
            }
        }
    }

    /// Fail everything in flight once the socket is gone.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(Error::StoreUnavailable(
                "relay connection closed".to_string(),
            )));
        }
        // Dropping the senders ends every subscription stream
        self.sinks.lock().clear();
    }
}

/// Signaling store hosted by a `huddle-relay` server.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteInner>,
    request_timeout: Duration,
}

impl RemoteStore {
    /// Connect to a relay's `/ws` endpoint, e.g. `ws://localhost:8080/ws`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("failed to connect to {}: {}", url, e)))?;
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let inner = Arc::new(RemoteInner {
            outbound,
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        });

        // ── Writer ────────────────────────────────────────────────────────
        runtime::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize client message: {}", e);
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        // ── Reader ────────────────────────────────────────────────────────
        let reader: Weak<RemoteInner> = Arc::downgrade(&inner);
        let relay_url = url.to_string();
        runtime::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let Some(inner) = reader.upgrade() else {
                    return;
                };
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => inner.dispatch(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to parse relay message");
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(relay = relay_url.as_str(), error = %e, "Relay socket error");
                        break;
                    }
                }
            }
            if let Some(inner) = reader.upgrade() {
                inner.disconnect();
            }
            tracing::info!(relay = relay_url.as_str(), "Relay connection closed");
        });

        tracing::info!(relay = url, "Connected to relay store");

        Ok(Self {
            inner,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether the socket is still open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request_with_id(&self, id: u64, op: StoreOp) -> Result<StoreReply> {
        if !self.is_connected() {
            return Err(Error::StoreUnavailable("relay connection closed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        if self.inner.outbound.send(ClientMessage::Request { id, op }).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(Error::StoreUnavailable("relay connection closed".to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::StoreUnavailable("relay connection closed".to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(Error::StoreUnavailable(format!("request {} timed out", id)))
            }
        }
    }

    async fn request(&self, op: StoreOp) -> Result<StoreReply> {
        let id = self.next_id();
        self.request_with_id(id, op).await
    }

    async fn subscribe(&self, sink: SubscriptionSink, op: StoreOp) -> Result<u64> {
        let id = self.next_id();
        self.inner.sinks.lock().insert(id, sink);

        match self.request_with_id(id, op).await {
            Ok(StoreReply::Subscribed) => Ok(id),
            Ok(other) => {
                self.inner.sinks.lock().remove(&id);
                Err(unexpected(other))
            }
            Err(e) => {
                self.inner.sinks.lock().remove(&id);
                Err(e)
            }
        }
    }

    fn cancel_handle(&self, subscription_id: u64) -> impl FnOnce() + Send + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                inner.sinks.lock().remove(&subscription_id);
                let _ = inner
                    .outbound
                    .send(ClientMessage::Unsubscribe { subscription_id });
            }
        }
    }
}

fn unexpected(reply: StoreReply) -> Error {
    Error::StoreUnavailable(format!("unexpected relay reply: {:?}", reply))
}

#[async_trait]
impl SignalingStore for RemoteStore {
    async fn get_document(&self, path: &DocumentPath) -> Result<Option<Document>> {
        match self.request(StoreOp::Get { path: path.clone() }).await? {
            StoreReply::Document { document } => Ok(document),
            other => Err(unexpected(other)),
        }
    }

    async fn set_document(&self, path: &DocumentPath, value: Document) -> Result<()> {
        match self
            .request(StoreOp::Set {
                path: path.clone(),
                value,
            })
            .await?
        {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn create_document(&self, path: &DocumentPath, value: Document) -> Result<bool> {
        match self
            .request(StoreOp::Create {
                path: path.clone(),
                value,
            })
            .await?
        {
            StoreReply::Created { created } => Ok(created),
            other => Err(unexpected(other)),
        }
    }

    async fn update_document(&self, path: &DocumentPath, partial: Document) -> Result<()> {
        match self
            .request(StoreOp::Update {
                path: path.clone(),
                partial,
            })
            .await?
        {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn add_to_collection(&self, path: &CollectionPath, value: Document) -> Result<String> {
        match self
            .request(StoreOp::Add {
                path: path.clone(),
                value,
            })
            .await?
        {
            StoreReply::Added { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn list_collection(&self, path: &CollectionPath) -> Result<Vec<CollectionEntry>> {
        match self.request(StoreOp::List { path: path.clone() }).await? {
            StoreReply::Entries { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_document(&self, path: &DocumentPath) -> Result<()> {
        match self.request(StoreOp::Delete { path: path.clone() }).await? {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn run_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        match self.request(StoreOp::Batch { ops }).await? {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe_document(
        &self,
        path: &DocumentPath,
    ) -> Result<Subscription<Option<Document>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe(
                SubscriptionSink::Document(tx),
                StoreOp::SubscribeDocument { path: path.clone() },
            )
            .await?;
        Ok(Subscription::new(rx, self.cancel_handle(id)))
    }

    async fn subscribe_collection(
        &self,
        path: &CollectionPath,
    ) -> Result<Subscription<CollectionEntry>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe(
                SubscriptionSink::Collection(tx),
                StoreOp::SubscribeCollection { path: path.clone() },
            )
            .await?;
        Ok(Subscription::new(rx, self.cancel_handle(id)))
    }
}
