//! Snapshot writer and the staged snapshot layout.
//!
//! ```text
//! manifest.json
//! collections/<name>.json
//! uploads/...
//! config/<file name>
//! ```

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    Result,
    enumerator::{CollectionDescriptor, validate_collection_name},
    error::{ManifestSnafu, SnapshotDecodeSnafu, SnapshotEncodeSnafu},
    fs_util::{copy_tree, ensure_dir, io_err},
    layout::{COLLECTION_FILE_EXT, COLLECTIONS_DIR, CONFIG_DIR, MANIFEST_NAME, UPLOADS_DIR},
    store::{Connection, Document},
};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Summary written at the staging root of every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub tool: String,
    /// RFC 3339, UTC.
    pub created_at: String,
    pub collections: Vec<CollectionEntry>,
    pub uploads_included: bool,
    pub config_included: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub name: String,
    pub documents: usize,
}

impl Manifest {
    pub fn new(collections: Vec<CollectionEntry>) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            tool: format!("snapvault/{}", env!("CARGO_PKG_VERSION")),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            collections,
            uploads_included: false,
            config_included: false,
            config_file_name: None,
        }
    }

    pub fn document_count(&self) -> usize {
        self.collections.iter().map(|c| c.documents).sum()
    }

    pub fn write(&self, staging: &Path) -> Result<()> {
        let path = staging.join(MANIFEST_NAME);
        let bytes = serde_json::to_vec_pretty(self).context(ManifestSnafu { path: &path })?;
        fs::write(&path, bytes).map_err(io_err(&path))
    }

    /// The manifest of a staged snapshot, if it has one.
    pub fn read(staging: &Path) -> Result<Option<Self>> {
        let path = staging.join(MANIFEST_NAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&path)(err)),
        };
        let manifest = serde_json::from_slice(&bytes).context(ManifestSnafu { path: &path })?;
        Ok(Some(manifest))
    }
}

/// `collections/<name>.json` under `staging`.
pub fn collection_path(staging: &Path, name: &str) -> PathBuf {
    staging
        .join(COLLECTIONS_DIR)
        .join(format!("{name}.{COLLECTION_FILE_EXT}"))
}

/// Reads every document of each collection from `conn` into its staging file.
/// Any read or write failure aborts the snapshot.
pub async fn write_collections<C: Connection>(
    conn: &C,
    staging: &Path,
    collections: &[CollectionDescriptor],
) -> Result<Vec<CollectionEntry>> {
    let dir = staging.join(COLLECTIONS_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(io_err(&dir))?;

    let mut entries = Vec::with_capacity(collections.len());
    for descriptor in collections {
        let name = &descriptor.name;
        let documents = conn.read_all(name).await?;
        let bytes =
            serde_json::to_vec(&documents).context(SnapshotEncodeSnafu { collection: name })?;
        let path = collection_path(staging, name);
        tokio::fs::write(&path, bytes).await.map_err(io_err(&path))?;
        debug!(collection = %name, documents = documents.len(), "collection staged");
        entries.push(CollectionEntry {
            name: name.clone(),
            documents: documents.len(),
        });
    }
    Ok(entries)
}

/// Copies the live uploads tree into `uploads/`. Returns `None` when there is
/// nothing to copy.
pub fn stage_uploads(staging: &Path, uploads_dir: Option<&Path>) -> Result<Option<usize>> {
    let Some(src) = uploads_dir else {
        return Ok(None);
    };
    if !src.is_dir() {
        warn!(uploads = %src.display(), "uploads directory not found; snapshot will not include uploads");
        return Ok(None);
    }
    let files = copy_tree(src, &staging.join(UPLOADS_DIR))?;
    debug!(uploads = %src.display(), files, "uploads staged");
    Ok(Some(files))
}

/// Copies the live configuration file into `config/`. Returns the staged file
/// name, or `None` when there is nothing to copy.
pub fn stage_config(staging: &Path, config_file: Option<&Path>) -> Result<Option<String>> {
    let Some(src) = config_file else {
        return Ok(None);
    };
    let file_name = src.file_name().and_then(|n| n.to_str());
    let (true, Some(file_name)) = (src.is_file(), file_name) else {
        warn!(config = %src.display(), "configuration file not found; snapshot will not include it");
        return Ok(None);
    };
    let dir = staging.join(CONFIG_DIR);
    ensure_dir(&dir)?;
    let dest = dir.join(file_name);
    fs::copy(src, &dest).map_err(io_err(src))?;
    debug!(config = %src.display(), "configuration staged");
    Ok(Some(file_name.to_string()))
}

/// Names of the collections present in a staged snapshot, sorted.
pub fn staged_collections(staging: &Path) -> Result<Vec<String>> {
    let dir = staging.join(COLLECTIONS_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("snapshot has no collections directory");
            return Ok(Vec::new());
        }
        Err(err) => return Err(io_err(&dir)(err)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let path = entry.map_err(io_err(&dir))?.path();
        if !path.is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(COLLECTION_FILE_EXT)
        {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if validate_collection_name(name).is_err() {
            warn!(file = %path.display(), "ignoring staged file with unusable collection name");
            continue;
        }
        names.push(name.to_string());
    }
    names.sort();
    Ok(names)
}

/// Documents of one staged collection.
pub async fn read_staged_collection(staging: &Path, name: &str) -> Result<Vec<Document>> {
    let path = collection_path(staging, name);
    let bytes = tokio::fs::read(&path).await.map_err(io_err(&path))?;
    serde_json::from_slice(&bytes).context(SnapshotDecodeSnafu {
        collection: name,
        path: &path,
    })
}

/// The staged configuration file, if the snapshot has one.
pub fn staged_config(staging: &Path) -> Result<Option<PathBuf>> {
    let dir = staging.join(CONFIG_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&dir)(err)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(io_err(&dir))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    if files.len() > 1 {
        warn!(count = files.len(), "snapshot holds several configuration files; using the first");
    }
    Ok(files.into_iter().next())
}

/// The staged uploads tree, if the snapshot has one.
pub fn staged_uploads(staging: &Path) -> Option<PathBuf> {
    let dir = staging.join(UPLOADS_DIR);
    dir.is_dir().then_some(dir)
}
