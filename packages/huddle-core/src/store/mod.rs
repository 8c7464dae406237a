//! # Signaling Store
//!
//! A thin document/collection interface over the shared store that both call
//! participants use as their out-of-band signaling channel.
//!
//! ## Data Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SIGNALING STORE LAYOUT                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  calls/                              (collection)                       │
//! │  └── {callId}                        (document: offer, answer?, ...)    │
//! │      ├── callerCandidates/           (collection, append-only)          │
//! │      │   └── {autoId}                (document: one ICE candidate)      │
//! │      └── calleeCandidates/           (collection, append-only)          │
//! │          └── {autoId}                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Paths alternate collection/document segments. Deleting a document does
//! not delete its sub-collections; callers remove those explicitly (usually
//! in the same [`BatchOp`] list).
//!
//! ## Implementations
//!
//! - [`MemoryStore`] - in-process store; also backs the relay server
//! - [`RemoteStore`] - WebSocket client for a relay-hosted store (native only)

mod memory;
pub mod protocol;
#[cfg(not(target_arch = "wasm32"))]
mod remote;

pub use memory::MemoryStore;
#[cfg(not(target_arch = "wasm32"))]
pub use remote::RemoteStore;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A document body: a JSON object.
pub type Document = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// PATHS
// ============================================================================

fn split_segments(path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

/// Path of a single document, e.g. `calls/alice_bob`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Parse a document path. It must have an even, non-zero number of segments.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        match split_segments(&path) {
            Some(segments) if segments.len() % 2 == 0 => Ok(Self(path)),
            _ => Err(Error::Internal(format!("invalid document path: {}", path))),
        }
    }

    /// The document's id (last segment).
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The collection containing this document.
    pub fn parent(&self) -> CollectionPath {
        let cut = self.0.rfind('/').unwrap_or(0);
        CollectionPath(self.0[..cut].to_string())
    }

    /// A sub-collection nested under this document.
    pub fn collection(&self, name: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.0, name))
    }

    /// Raw path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DocumentPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DocumentPath> for String {
    fn from(path: DocumentPath) -> Self {
        path.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of a collection, e.g. `calls/alice_bob/callerCandidates`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Parse a collection path. It must have an odd number of segments.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        match split_segments(&path) {
            Some(segments) if segments.len() % 2 == 1 => Ok(Self(path)),
            _ => Err(Error::Internal(format!("invalid collection path: {}", path))),
        }
    }

    /// A document inside this collection.
    pub fn doc(&self, id: &str) -> DocumentPath {
        DocumentPath(format!("{}/{}", self.0, id))
    }

    /// The collection name (last segment).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Raw path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CollectionPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CollectionPath> for String {
    fn from(path: CollectionPath) -> Self {
        path.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// A member of a collection, as listed or delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    /// Collection the entry belongs to
    pub collection: CollectionPath,
    /// Generated id of the entry
    pub id: String,
    /// Entry body
    pub data: Document,
}

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchOp {
    /// Delete a document (absent documents are ignored)
    Delete {
        /// Document to delete
        path: DocumentPath,
    },
    /// Merge fields into an existing document
    Update {
        /// Document to update
        path: DocumentPath,
        /// Fields to merge
        partial: Document,
    },
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// A live stream of store events.
///
/// Events are delivered until [`Subscription::unsubscribe`] is called or the
/// subscription is dropped.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    /// Wrap a receiver with the action that detaches it from its source.
    pub fn new(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Wait for the next event. `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop delivery.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Operations over the shared signaling store.
///
/// All operations are remote and asynchronous. Reads never fail for a missing
/// document; they return `None`. Any transport-level failure surfaces as
/// [`Error::StoreUnavailable`].
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Read a document.
    async fn get_document(&self, path: &DocumentPath) -> Result<Option<Document>>;

    /// Create or replace a document.
    async fn set_document(&self, path: &DocumentPath, value: Document) -> Result<()>;

    /// Create a document only if none exists. Returns `false` if one did.
    async fn create_document(&self, path: &DocumentPath, value: Document) -> Result<bool>;

    /// Merge fields into an existing document.
    ///
    /// Fails with [`Error::DocumentNotFound`] if the document is absent.
    async fn update_document(&self, path: &DocumentPath, partial: Document) -> Result<()>;

    /// Append a document with a generated id and return that id.
    async fn add_to_collection(&self, path: &CollectionPath, value: Document) -> Result<String>;

    /// List a collection's members in insertion order.
    async fn list_collection(&self, path: &CollectionPath) -> Result<Vec<CollectionEntry>>;

    /// Delete a document. Missing documents are not an error.
    async fn delete_document(&self, path: &DocumentPath) -> Result<()>;

    /// Apply every operation or none of them.
    async fn run_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Watch a document: the current snapshot first, then one per change.
    /// `None` means the document does not exist (or was deleted).
    async fn subscribe_document(
        &self,
        path: &DocumentPath,
    ) -> Result<Subscription<Option<Document>>>;

    /// Watch a collection: existing members first, then each addition.
    async fn subscribe_collection(
        &self,
        path: &CollectionPath,
    ) -> Result<Subscription<CollectionEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_path_parts() {
        let path = DocumentPath::new("calls/alice_bob").unwrap();
        assert_eq!(path.id(), "alice_bob");
        assert_eq!(path.parent().as_str(), "calls");

        let candidates = path.collection("callerCandidates");
        assert_eq!(candidates.as_str(), "calls/alice_bob/callerCandidates");
        assert_eq!(candidates.name(), "callerCandidates");
        assert_eq!(candidates.doc("x1").parent(), candidates);
    }

    #[test]
    fn test_path_segment_validation() {
        assert!(DocumentPath::new("calls").is_err());
        assert!(DocumentPath::new("calls//x").is_err());
        assert!(DocumentPath::new("").is_err());
        assert!(CollectionPath::new("calls/alice_bob").is_err());
        assert!(CollectionPath::new("calls").is_ok());
    }

    #[test]
    fn test_paths_deserialize_with_validation() {
        let ok: DocumentPath = serde_json::from_str("\"calls/a_b\"").unwrap();
        assert_eq!(ok.as_str(), "calls/a_b");
        assert!(serde_json::from_str::<DocumentPath>("\"calls\"").is_err());
    }

    #[test]
    fn test_batch_op_wire_format() {
        let op = BatchOp::Delete {
            path: DocumentPath::new("calls/a_b").unwrap(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"kind\":\"delete\""));
        assert!(json.contains("calls/a_b"));
    }

    #[tokio::test]
    async fn test_subscription_cancel_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let mut sub = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(7).unwrap();
        assert_eq!(sub.recv().await, Some(7));

        sub.unsubscribe();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(tx.send(8).is_err());
    }
}
