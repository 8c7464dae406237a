//! In-process signaling store.
//!
//! Every mutation and the watcher notifications it causes happen under one
//! lock, so observers never see half of a batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    BatchOp, CollectionEntry, CollectionPath, Document, DocumentPath, SignalingStore,
    Subscription,
};
use crate::error::{Error, Result};

struct StoredDocument {
    data: Document,
    /// Insertion sequence, used to order collection listings.
    seq: u64,
}

struct Watcher<P, T> {
    id: u64,
    path: P,
    tx: mpsc::UnboundedSender<T>,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<DocumentPath, StoredDocument>,
    next_seq: u64,
    next_watcher_id: u64,
    document_watchers: Vec<Watcher<DocumentPath, Option<Document>>>,
    collection_watchers: Vec<Watcher<CollectionPath, CollectionEntry>>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn notify_document(&mut self, path: &DocumentPath) {
        let snapshot = self.documents.get(path).map(|d| d.data.clone());
        self.document_watchers.retain(|w| {
            if &w.path != path {
                return true;
            }
            w.tx.send(snapshot.clone()).is_ok()
        });
    }

    fn notify_added(&mut self, path: &DocumentPath) {
        let Some(stored) = self.documents.get(path) else {
            return;
        };
        let entry = CollectionEntry {
            collection: path.parent(),
            id: path.id().to_string(),
            data: stored.data.clone(),
        };
        self.collection_watchers.retain(|w| {
            if w.path != entry.collection {
                return true;
            }
            w.tx.send(entry.clone()).is_ok()
        });
    }

    /// Insert or replace. Returns true when the document is new.
    fn put(&mut self, path: &DocumentPath, data: Document) -> bool {
        if let Some(existing) = self.documents.get_mut(path) {
            existing.data = data;
            self.notify_document(path);
            return false;
        }
        let seq = self.next_seq();
        self.documents
            .insert(path.clone(), StoredDocument { data, seq });
        self.notify_document(path);
        self.notify_added(path);
        true
    }

    fn merge(&mut self, path: &DocumentPath, partial: Document) -> Result<()> {
        let stored = self
            .documents
            .get_mut(path)
            .ok_or_else(|| Error::DocumentNotFound(path.to_string()))?;
        for (key, value) in partial {
            stored.data.insert(key, value);
        }
        self.notify_document(path);
        Ok(())
    }

    fn remove(&mut self, path: &DocumentPath) {
        if self.documents.remove(path).is_some() {
            self.notify_document(path);
        }
    }

    fn entries(&self, path: &CollectionPath) -> Vec<CollectionEntry> {
        let mut members: Vec<(u64, CollectionEntry)> = self
            .documents
            .iter()
            .filter(|(doc_path, _)| &doc_path.parent() == path)
            .map(|(doc_path, stored)| {
                (
                    stored.seq,
                    CollectionEntry {
                        collection: path.clone(),
                        id: doc_path.id().to_string(),
                        data: stored.data.clone(),
                    },
                )
            })
            .collect();
        members.sort_by_key(|(seq, _)| *seq);
        members.into_iter().map(|(_, entry)| entry).collect()
    }
}

/// Signaling store held in process memory.
///
/// Cheap to clone; clones share the same documents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents (across all collections).
    pub fn document_count(&self) -> usize {
        self.inner.lock().documents.len()
    }

    /// Number of live subscriptions.
    pub fn watcher_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.document_watchers.len() + inner.collection_watchers.len()
    }

    /// Paths of every document directly inside `collection`.
    pub fn document_paths(&self, collection: &CollectionPath) -> Vec<DocumentPath> {
        self.inner
            .lock()
            .documents
            .keys()
            .filter(|p| &p.parent() == collection)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn get_document(&self, path: &DocumentPath) -> Result<Option<Document>> {
        Ok(self.inner.lock().documents.get(path).map(|d| d.data.clone()))
    }

    async fn set_document(&self, path: &DocumentPath, value: Document) -> Result<()> {
        self.inner.lock().put(path, value);
        Ok(())
    }

    async fn create_document(&self, path: &DocumentPath, value: Document) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.documents.contains_key(path) {
            return Ok(false);
        }
        inner.put(path, value);
        Ok(true)
    }

    async fn update_document(&self, path: &DocumentPath, partial: Document) -> Result<()> {
        self.inner.lock().merge(path, partial)
    }

    async fn add_to_collection(&self, path: &CollectionPath, value: Document) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        self.inner.lock().put(&path.doc(&id), value);
        Ok(id)
    }

    async fn list_collection(&self, path: &CollectionPath) -> Result<Vec<CollectionEntry>> {
        Ok(self.inner.lock().entries(path))
    }

    async fn delete_document(&self, path: &DocumentPath) -> Result<()> {
        self.inner.lock().remove(path);
        Ok(())
    }

    async fn run_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut inner = self.inner.lock();

        // Validate in order against the batch's own deletes, so a failing
        // update leaves nothing applied
        let mut deleted: BTreeSet<&DocumentPath> = BTreeSet::new();
        for op in &ops {
            match op {
                BatchOp::Delete { path } => {
                    deleted.insert(path);
                }
                BatchOp::Update { path, .. } => {
                    if deleted.contains(path) || !inner.documents.contains_key(path) {
                        return Err(Error::DocumentNotFound(path.to_string()));
                    }
                }
            }
        }

        for op in ops {
            match op {
                BatchOp::Delete { path } => inner.remove(&path),
                BatchOp::Update { path, partial } => inner.merge(&path, partial)?,
            }
        }
        Ok(())
    }

    async fn subscribe_document(
        &self,
        path: &DocumentPath,
    ) -> Result<Subscription<Option<Document>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            let current = inner.documents.get(path).map(|d| d.data.clone());
            let _ = tx.send(current);
            inner.next_watcher_id += 1;
            let id = inner.next_watcher_id;
            inner.document_watchers.push(Watcher {
                id,
                path: path.clone(),
                tx,
            });
            id
        };

        let store = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = store.upgrade() {
                inner.lock().document_watchers.retain(|w| w.id != id);
            }
        }))
    }

    async fn subscribe_collection(
        &self,
        path: &CollectionPath,
    ) -> Result<Subscription<CollectionEntry>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            for entry in inner.entries(path) {
                let _ = tx.send(entry);
            }
            inner.next_watcher_id += 1;
            let id = inner.next_watcher_id;
            inner.collection_watchers.push(Watcher {
                id,
                path: path.clone(),
                tx,
            });
            id
        };

        let store = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = store.upgrade() {
                inner.lock().collection_watchers.retain(|w| w.id != id);
            }
        }))
    }
}
