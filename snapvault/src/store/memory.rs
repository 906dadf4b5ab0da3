//! In-process store.
//!
//! Useful for embedding and for tests: every call is recorded, so a test can
//! assert exactly what the engine asked of the store (or that it asked nothing).

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::debug;

use super::{Connection, DataStore, Document, InsertFailure, InsertOutcome, document_key};
use crate::error::StoreError;

/// A call received by a `MemoryStore` or one of its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Connect,
    ListCollections,
    ReadAll(String),
    DeleteAll(String),
    InsertMany { collection: String, count: usize },
    Close,
}

#[derive(Default)]
struct MemoryState {
    collections: Mutex<BTreeMap<String, Vec<Document>>>,
    calls: Mutex<Vec<StoreCall>>,
    failing_reads: Mutex<BTreeSet<String>>,
    stalled_reads: Mutex<BTreeSet<String>>,
    failing_deletes: Mutex<BTreeSet<String>>,
    open: AtomicUsize,
}

/// Collections held in memory, shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<MemoryState>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collections", &self.state.collections.lock().len())
            .field("open", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents of `collection`.
    #[must_use]
    pub fn with_collection(self, collection: &str, documents: Vec<Document>) -> Self {
        self.set_collection(collection, documents);
        self
    }

    pub fn set_collection(&self, collection: &str, documents: Vec<Document>) {
        self.state
            .collections
            .lock()
            .insert(collection.to_string(), documents);
    }

    pub fn collection(&self, collection: &str) -> Option<Vec<Document>> {
        self.state.collections.lock().get(collection).cloned()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.state.collections.lock().keys().cloned().collect()
    }

    /// Makes `read_all` fail for `collection`.
    pub fn fail_reads_on(&self, collection: &str) {
        self.state.failing_reads.lock().insert(collection.to_string());
    }

    /// Makes `read_all` for `collection` never complete.
    pub fn stall_reads_on(&self, collection: &str) {
        self.state.stalled_reads.lock().insert(collection.to_string());
    }

    /// Makes `delete_all` fail for `collection`.
    pub fn fail_deletes_on(&self, collection: &str) {
        self.state
            .failing_deletes
            .lock()
            .insert(collection.to_string());
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().clear();
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    fn record(&self, call: StoreCall) {
        self.state.calls.lock().push(call);
    }
}

impl DataStore for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        self.record(StoreCall::Connect);
        self.state.open.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            store: self.clone(),
        })
    }
}

/// Connection to a `MemoryStore`.
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
}

impl Connection for MemoryConnection {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.store.record(StoreCall::ListCollections);
        Ok(self.store.collection_names())
    }

    async fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.store.record(StoreCall::ReadAll(collection.to_string()));
        if self.store.state.failing_reads.lock().contains(collection) {
            return Err(StoreError::Rejected {
                operation: "read",
                collection: collection.to_string(),
                message: "injected failure".to_string(),
            });
        }
        let stalled = self.store.state.stalled_reads.lock().contains(collection);
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(self.store.collection(collection).unwrap_or_default())
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, StoreError> {
        self.store
            .record(StoreCall::DeleteAll(collection.to_string()));
        if self.store.state.failing_deletes.lock().contains(collection) {
            return Err(StoreError::Rejected {
                operation: "delete",
                collection: collection.to_string(),
                message: "injected failure".to_string(),
            });
        }
        let mut collections = self.store.state.collections.lock();
        let removed = collections
            .get_mut(collection)
            .map_or(0, |docs| std::mem::take(docs).len());
        Ok(removed as u64)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertOutcome, StoreError> {
        self.store.record(StoreCall::InsertMany {
            collection: collection.to_string(),
            count: documents.len(),
        });
        let mut collections = self.store.state.collections.lock();
        let target = collections.entry(collection.to_string()).or_default();
        let outcome = insert_unordered(target, documents);
        debug!(
            collection,
            inserted = outcome.inserted,
            failed = outcome.failures.len(),
            "memory store insert"
        );
        Ok(outcome)
    }

    async fn close(self) -> Result<(), StoreError> {
        self.store.record(StoreCall::Close);
        self.store.state.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Appends `documents` to `target`, rejecting non-objects and duplicate `_id`s
/// individually.
pub(super) fn insert_unordered(
    target: &mut Vec<Document>,
    documents: Vec<Document>,
) -> InsertOutcome {
    let mut seen: HashSet<String> = target.iter().filter_map(document_key).collect();
    let mut outcome = InsertOutcome::default();
    for (index, document) in documents.into_iter().enumerate() {
        if !document.is_object() {
            outcome.failures.push(InsertFailure {
                index,
                message: "document is not a JSON object".to_string(),
            });
            continue;
        }
        if let Some(key) = document_key(&document)
            && !seen.insert(key.clone())
        {
            outcome.failures.push(InsertFailure {
                index,
                message: format!("duplicate _id {key}"),
            });
            continue;
        }
        target.push(document);
        outcome.inserted += 1;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn insert_rejects_duplicates_and_keeps_going() {
        let store = MemoryStore::new();
        let conn = store.connect().await.unwrap();
        let outcome = conn
            .insert_many(
                "employees",
                vec![
                    json!({"_id": 1, "name": "a"}),
                    json!({"_id": 1, "name": "dup"}),
                    json!("not a document"),
                    json!({"_id": 2, "name": "b"}),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(
            outcome
                .failures
                .iter()
                .map(|f| f.index)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(store.collection("employees").unwrap().len(), 2);
        conn.close().await.unwrap();
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn calls_are_recorded_in_order() {
        let store = MemoryStore::new().with_collection("departments", vec![json!({"_id": "d1"})]);
        let conn = store.connect().await.unwrap();
        assert_eq!(conn.delete_all("departments").await.unwrap(), 1);
        conn.close().await.unwrap();
        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Connect,
                StoreCall::DeleteAll("departments".into()),
                StoreCall::Close
            ]
        );
    }

    #[tokio::test]
    async fn ids_of_different_json_types_are_distinct() {
        let store = MemoryStore::new();
        let conn = store.connect().await.unwrap();
        let outcome = conn
            .insert_many(
                "employees",
                vec![
                    json!({"_id": 1, "n": "a"}),
                    json!({"_id": "1", "n": "b"}),
                    json!({"_id": "1", "n": "c"}),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 2);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn injected_read_failure() {
        let store = MemoryStore::new().with_collection("payroll", vec![json!({"_id": 1})]);
        store.fail_reads_on("payroll");
        let conn = store.connect().await.unwrap();
        assert!(matches!(
            conn.read_all("payroll").await,
            Err(StoreError::Rejected { operation: "read", .. })
        ));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn injected_delete_failure() {
        let store = MemoryStore::new();
        store.fail_deletes_on("epf");
        let conn = store.connect().await.unwrap();
        assert!(conn.delete_all("epf").await.is_err());
        conn.close().await.unwrap();
    }
}
