//! Data-store collaborator.
//!
//! The engine treats collections as opaque named lists of JSON documents. A
//! [`DataStore`] hands out one [`Connection`] per backup or restore; the
//! engine closes it on every exit path.

use std::future::Future;

use serde::Serialize;

use crate::error::StoreError;

mod json_dir;
mod memory;

pub use json_dir::JsonDirStore;
pub use memory::{MemoryStore, StoreCall};

/// An opaque structured record.
pub type Document = serde_json::Value;

/// Source of connections.
pub trait DataStore: Send + Sync {
    type Connection: Connection + 'static;

    /// Opens a connection for the duration of one operation.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, StoreError>> + Send;
}

/// Operations the engine needs from a live connection.
pub trait Connection: Send + Sync {
    /// Names of every persisted collection.
    fn list_collections(&self) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Every document of `collection`, in storage order.
    fn read_all(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Removes every document of `collection`; returns the number removed.
    fn delete_all(&self, collection: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Inserts `documents` without stopping at the first rejected one.
    ///
    /// Rejected documents are reported in the outcome; an `Err` means the
    /// insert as a whole could not be attempted.
    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> impl Future<Output = Result<InsertOutcome, StoreError>> + Send;

    /// Releases the connection. If an operation is cancelled before it can
    /// call this, the engine calls it from a background task instead.
    fn close(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Result of an unordered bulk insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub failures: Vec<InsertFailure>,
}

/// One document the store refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsertFailure {
    /// Position of the document in the submitted list.
    pub index: usize,
    pub message: String,
}

/// JSON text of a document's `_id` field, used by the bundled backends as a
/// unique key. `1` and `"1"` are different keys.
pub(crate) fn document_key(document: &Document) -> Option<String> {
    document.get("_id").map(serde_json::Value::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn keys_keep_json_types_apart() {
        let number = document_key(&json!({"_id": 1})).unwrap();
        let text = document_key(&json!({"_id": "1"})).unwrap();
        assert_ne!(number, text);
        assert_eq!(text, r#""1""#);
        assert_eq!(
            document_key(&json!({"_id": {"a": 1, "b": 2}})),
            document_key(&json!({"_id": {"b": 2, "a": 1}}))
        );
        assert_eq!(document_key(&json!({"name": "x"})), None);
    }
}
