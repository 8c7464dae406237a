//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! executing store operations against the shared store, and streaming
//! subscription events back to the client.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use huddle_core::store::protocol::{ClientMessage, ServerMessage, StoreOp, StoreReply};
use huddle_core::store::SignalingStore;
use huddle_core::Error;

use crate::state::{ClientSender, RelayState};

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Assigns the connection an id and registers its outbound channel
/// 2. Spawns a sender task to forward outbound messages
/// 3. Processes incoming messages until the connection closes
/// 4. Stops the connection's subscriptions
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // ── Step 1: Register Client ───────────────────────────────────────────

    let connection_id = uuid::Uuid::new_v4().to_string();
    state.register_client(&connection_id, tx);

    // ── Step 2: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 3: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &connection_id, client_msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        connection = connection_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.send_to_client(
                        &connection_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::debug!(connection = connection_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    connection = connection_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    state.unregister_client(&connection_id);
    sender_task.abort();
}

/// Handle a parsed client message.
async fn handle_client_message(state: &RelayState, connection_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::Request { id, op } => {
            let Some(sender) = state.client_sender(connection_id) else {
                return;
            };
            let reply = match op {
                StoreOp::SubscribeDocument { .. } | StoreOp::SubscribeCollection { .. } => {
                    subscribe(state, connection_id, id, op, sender.clone()).await
                }
                op => execute(&state.store, op).await,
            };
            let message = match reply {
                Ok(reply) => ServerMessage::Response { id, reply },
                Err(e) => {
                    tracing::debug!(
                        connection = connection_id,
                        request = id,
                        error = %e,
                        "Store request failed"
                    );
                    ServerMessage::Failed {
                        id,
                        code: e.code(),
                        message: e.detail(),
                    }
                }
            };
            let _ = sender.send(message);
        }

        ClientMessage::Unsubscribe { subscription_id } => {
            if !state.stop_subscription(connection_id, subscription_id) {
                tracing::debug!(
                    connection = connection_id,
                    subscription = subscription_id,
                    "Unsubscribe for unknown subscription"
                );
            }
        }

        ClientMessage::Ping => {
            state.send_to_client(connection_id, ServerMessage::Pong);
        }
    }
}

/// Run a one-shot store operation.
async fn execute(store: &impl SignalingStore, op: StoreOp) -> huddle_core::Result<StoreReply> {
    let reply = match op {
        StoreOp::Get { path } => StoreReply::Document {
            document: store.get_document(&path).await?,
        },
        StoreOp::Set { path, value } => {
            store.set_document(&path, value).await?;
            StoreReply::Done
        }
        StoreOp::Create { path, value } => StoreReply::Created {
            created: store.create_document(&path, value).await?,
        },
        StoreOp::Update { path, partial } => {
            store.update_document(&path, partial).await?;
            StoreReply::Done
        }
        StoreOp::Add { path, value } => StoreReply::Added {
            id: store.add_to_collection(&path, value).await?,
        },
        StoreOp::List { path } => StoreReply::Entries {
            entries: store.list_collection(&path).await?,
        },
        StoreOp::Delete { path } => {
            store.delete_document(&path).await?;
            StoreReply::Done
        }
        StoreOp::Batch { ops } => {
            store.run_batch(ops).await?;
            StoreReply::Done
        }
        StoreOp::SubscribeDocument { .. } | StoreOp::SubscribeCollection { .. } => {
            return Err(Error::Internal(
                "subscriptions are not one-shot operations".to_string(),
            ))
        }
    };
    Ok(reply)
}

/// Open a store subscription and spawn a task forwarding its events to the
/// client. The subscription is identified by the request id that opened it.
async fn subscribe(
    state: &RelayState,
    connection_id: &str,
    subscription_id: u64,
    op: StoreOp,
    sender: ClientSender,
) -> huddle_core::Result<StoreReply> {
    let task = match op {
        StoreOp::SubscribeDocument { path } => {
            let mut subscription = state.store.subscribe_document(&path).await?;
            tokio::spawn(async move {
                while let Some(document) = subscription.recv().await {
                    let message = ServerMessage::DocumentSnapshot {
                        subscription_id,
                        document,
                    };
                    if sender.send(message).is_err() {
                        break;
                    }
                }
            })
        }
        StoreOp::SubscribeCollection { path } => {
            let mut subscription = state.store.subscribe_collection(&path).await?;
            tokio::spawn(async move {
                while let Some(entry) = subscription.recv().await {
                    let message = ServerMessage::CollectionAdded {
                        subscription_id,
                        entry,
                    };
                    if sender.send(message).is_err() {
                        break;
                    }
                }
            })
        }
        other => return execute(&state.store, other).await,
    };

    state.track_subscription(connection_id, subscription_id, task.abort_handle());
    tracing::debug!(
        connection = connection_id,
        subscription = subscription_id,
        "Subscription opened"
    );
    Ok(StoreReply::Subscribed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::store::{BatchOp, CollectionPath, DocumentPath, MemoryStore};
    use serde_json::json;

    fn doc(value: serde_json::Value) -> huddle_core::store::Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_execute_get_missing_document() {
        let store = MemoryStore::new();
        let reply = execute(
            &store,
            StoreOp::Get {
                path: DocumentPath::new("calls/a_b").unwrap(),
            },
        )
        .await
        .unwrap();
        assert_eq!(reply, StoreReply::Document { document: None });
    }

    #[tokio::test]
    async fn test_execute_create_reports_existing() {
        let store = MemoryStore::new();
        let path = DocumentPath::new("calls/a_b").unwrap();
        let op = StoreOp::Create {
            path: path.clone(),
            value: doc(json!({"callerId": "a"})),
        };
        assert_eq!(
            execute(&store, op.clone()).await.unwrap(),
            StoreReply::Created { created: true }
        );
        assert_eq!(
            execute(&store, op).await.unwrap(),
            StoreReply::Created { created: false }
        );
    }

    #[tokio::test]
    async fn test_execute_update_missing_keeps_error_code() {
        let store = MemoryStore::new();
        let err = execute(
            &store,
            StoreOp::Update {
                path: DocumentPath::new("calls/a_b").unwrap(),
                partial: doc(json!({"answer": {}})),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 401);
    }

    #[tokio::test]
    async fn test_execute_add_then_list_and_batch_delete() {
        let store = MemoryStore::new();
        let candidates = CollectionPath::new("calls/a_b/callerCandidates").unwrap();

        let id = match execute(
            &store,
            StoreOp::Add {
                path: candidates.clone(),
                value: doc(json!({"candidate": "c1"})),
            },
        )
        .await
        .unwrap()
        {
            StoreReply::Added { id } => id,
            other => panic!("Wrong reply: {:?}", other),
        };

        match execute(&store, StoreOp::List { path: candidates.clone() }).await.unwrap() {
            StoreReply::Entries { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].id, id);
            }
            other => panic!("Wrong reply: {:?}", other),
        }

        let reply = execute(
            &store,
            StoreOp::Batch {
                ops: vec![BatchOp::Delete {
                    path: candidates.doc(&id),
                }],
            },
        )
        .await
        .unwrap();
        assert_eq!(reply, StoreReply::Done);
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_forwards_snapshots_to_client() {
        let state = RelayState::new(crate::state::RelayConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register_client("conn-1", tx.clone());

        let path = DocumentPath::new("calls/a_b").unwrap();
        let reply = subscribe(
            &state,
            "conn-1",
            5,
            StoreOp::SubscribeDocument { path: path.clone() },
            tx,
        )
        .await
        .unwrap();
        assert_eq!(reply, StoreReply::Subscribed);
        assert_eq!(state.subscription_count(), 1);

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::DocumentSnapshot {
                subscription_id: 5,
                document: None,
            })
        );

        state
            .store
            .set_document(&path, doc(json!({"callerId": "a"})))
            .await
            .unwrap();
        match rx.recv().await {
            Some(ServerMessage::DocumentSnapshot {
                subscription_id: 5,
                document: Some(document),
            }) => assert_eq!(document["callerId"], "a"),
            other => panic!("Wrong message: {:?}", other),
        }

        assert!(state.stop_subscription("conn-1", 5));
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let state = RelayState::new(crate::state::RelayConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register_client("conn-1", tx);

        handle_client_message(&state, "conn-1", ClientMessage::Ping).await;
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_failed_request_carries_code_and_detail() {
        let state = RelayState::new(crate::state::RelayConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register_client("conn-1", tx);

        let path = DocumentPath::new("calls/a_b").unwrap();
        handle_client_message(
            &state,
            "conn-1",
            ClientMessage::Request {
                id: 11,
                op: StoreOp::Update {
                    path: path.clone(),
                    partial: doc(json!({"x": 1})),
                },
            },
        )
        .await;

        match rx.recv().await {
            Some(ServerMessage::Failed { id, code, message }) => {
                assert_eq!(id, 11);
                let restored = Error::from_code(code, message);
                assert_eq!(restored, Error::DocumentNotFound(path.to_string()));
            }
            other => panic!("Wrong message: {:?}", other),
        }
    }
}
