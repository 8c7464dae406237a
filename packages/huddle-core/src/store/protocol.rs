//! Relay store protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol. Every request
//! carries a client-chosen `id`; the response echoes it. A subscription is
//! identified by the id of the request that opened it.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use super::{BatchOp, CollectionEntry, CollectionPath, Document, DocumentPath};

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Perform a store operation.
    Request {
        id: u64,
        op: StoreOp,
    },

    /// Stop a subscription opened by an earlier `Subscribe*` request.
    Unsubscribe {
        subscription_id: u64,
    },

    /// Ping to keep connection alive.
    Ping,
}

/// A single store operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    Get {
        path: DocumentPath,
    },
    Set {
        path: DocumentPath,
        value: Document,
    },
    Create {
        path: DocumentPath,
        value: Document,
    },
    Update {
        path: DocumentPath,
        partial: Document,
    },
    Add {
        path: CollectionPath,
        value: Document,
    },
    List {
        path: CollectionPath,
    },
    Delete {
        path: DocumentPath,
    },
    Batch {
        ops: Vec<BatchOp>,
    },
    SubscribeDocument {
        path: DocumentPath,
    },
    SubscribeCollection {
        path: CollectionPath,
    },
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successful result of a request.
    Response {
        id: u64,
        reply: StoreReply,
    },

    /// A request failed. `code` is an [`Error::code`](crate::Error::code).
    Failed {
        id: u64,
        code: i32,
        message: String,
    },

    /// New snapshot for a document subscription.
    DocumentSnapshot {
        subscription_id: u64,
        document: Option<Document>,
    },

    /// New member of a collection subscription.
    CollectionAdded {
        subscription_id: u64,
        entry: CollectionEntry,
    },

    /// Pong response to keep connection alive.
    Pong,

    /// Error not tied to a request (e.g. unparseable message).
    Error {
        message: String,
    },
}

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreReply {
    Document { document: Option<Document> },
    Created { created: bool },
    Added { id: String },
    Entries { entries: Vec<CollectionEntry> },
    Subscribed,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let msg = ClientMessage::Request {
            id: 7,
            op: StoreOp::Get {
                path: DocumentPath::new("calls/alice_bob").unwrap(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"request\""));
        assert!(json.contains("\"op\":\"get\""));
        assert!(json.contains("calls/alice_bob"));
    }

    #[test]
    fn test_subscribe_collection_parses() {
        let raw = r#"{"type":"request","id":3,"op":{"op":"subscribe_collection","path":"calls/a_b/callerCandidates"}}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        match parsed {
            ClientMessage::Request {
                id,
                op: StoreOp::SubscribeCollection { path },
            } => {
                assert_eq!(id, 3);
                assert_eq!(path.name(), "callerCandidates");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_path_is_rejected_at_parse_time() {
        let raw = r#"{"type":"request","id":1,"op":{"op":"get","path":"calls"}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_failed_response_serialization() {
        let msg = ServerMessage::Failed {
            id: 9,
            code: 401,
            message: "Document not found: calls/x".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"failed\""));
        assert!(json.contains("\"code\":401"));
    }

    #[test]
    fn test_document_snapshot_with_deleted_document() {
        let msg = ServerMessage::DocumentSnapshot {
            subscription_id: 4,
            document: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "document_snapshot");
        assert!(json["document"].is_null());
    }

    #[test]
    fn test_collection_added_carries_entry() {
        let entry = CollectionEntry {
            collection: CollectionPath::new("calls/a_b/calleeCandidates").unwrap(),
            id: "abc".to_string(),
            data: json!({"candidate": "candidate:1"}).as_object().cloned().unwrap(),
        };
        let msg = ServerMessage::CollectionAdded {
            subscription_id: 2,
            entry: entry.clone(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed,
            ServerMessage::CollectionAdded {
                subscription_id: 2,
                entry
            }
        );
    }
}
