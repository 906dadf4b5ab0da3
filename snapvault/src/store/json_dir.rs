//! File-backed store: one `<collection>.json` array per collection in a directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Connection, DataStore, Document, InsertOutcome, memory::insert_unordered};
use crate::error::StoreError;

const COLLECTION_EXT: &str = "json";

/// A directory of JSON collection files.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DataStore for JsonDirStore {
    type Connection = JsonDirConnection;

    async fn connect(&self) -> Result<JsonDirConnection, StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::File {
                path: self.root.clone(),
                source,
            })?;
        debug!(root = %self.root.display(), "json store connected");
        Ok(JsonDirConnection {
            root: self.root.clone(),
        })
    }
}

/// Connection to a `JsonDirStore`.
#[derive(Debug)]
pub struct JsonDirConnection {
    root: PathBuf,
}

impl JsonDirConnection {
    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.{COLLECTION_EXT}"))
    }

    async fn load(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let path = self.collection_path(collection);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::File { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            collection: collection.to_string(),
            path,
            source,
        })
    }

    async fn save(&self, collection: &str, documents: &[Document]) -> Result<(), StoreError> {
        let path = self.collection_path(collection);
        let bytes = serde_json::to_vec(documents).map_err(|source| StoreError::Corrupt {
            collection: collection.to_string(),
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension(format!("{COLLECTION_EXT}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| StoreError::File {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::File { path, source })
    }
}

impl Connection for JsonDirConnection {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let file_err = |source| StoreError::File {
            path: self.root.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(file_err)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(file_err)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(COLLECTION_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.load(collection).await
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, StoreError> {
        let existing = self.load(collection).await?;
        self.save(collection, &[]).await?;
        Ok(existing.len() as u64)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut existing = self.load(collection).await?;
        let outcome = insert_unordered(&mut existing, documents);
        self.save(collection, &existing).await?;
        Ok(outcome)
    }

    async fn close(self) -> Result<(), StoreError> {
        debug!(root = %self.root.display(), "json store connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn collections_round_trip_through_files() {
        let temp = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(temp.path().join("data"));
        let conn = store.connect().await.unwrap();

        let outcome = conn
            .insert_many("departments", vec![json!({"_id": "d1"}), json!({"_id": "d2"})])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        conn.insert_many("employees", vec![json!({"_id": "e1", "dept": "d1"})])
            .await
            .unwrap();

        assert_eq!(
            conn.list_collections().await.unwrap(),
            vec!["departments", "employees"]
        );
        assert_eq!(conn.read_all("departments").await.unwrap().len(), 2);
        assert_eq!(conn.delete_all("departments").await.unwrap(), 2);
        assert!(conn.read_all("departments").await.unwrap().is_empty());
        assert!(conn.read_all("missing").await.unwrap().is_empty());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_collection_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("broken.json"), b"{not json").unwrap();
        let store = JsonDirStore::new(temp.path());
        let conn = store.connect().await.unwrap();
        let err = conn.read_all("broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        conn.close().await.unwrap();
    }
}
