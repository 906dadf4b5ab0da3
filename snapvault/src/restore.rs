//! Dependency-ordered collection restore and the auxiliary (uploads + config) restore.

use std::{
    collections::BTreeSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    Result,
    config::DependencyOrder,
    error::CollectionDeleteSnafu,
    fs_util::{copy_tree, io_err},
    layout::CONFIG_BACKUP_TIMESTAMP_FORMAT,
    snapshot::{read_staged_collection, staged_config, staged_uploads},
    store::{Connection, InsertFailure},
};

/// What happened to one collection during a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRestore {
    pub name: String,
    /// Documents found in the snapshot.
    pub staged: usize,
    /// Live documents removed before inserting.
    pub deleted: u64,
    pub inserted: usize,
    /// Documents the store refused; the rest of the collection was still inserted.
    pub failures: Vec<InsertFailure>,
    /// The snapshot held no documents, so the live collection was left alone.
    pub skipped_empty: bool,
}

/// Outcome of `restore_backup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub artifact: String,
    /// In the order they were restored.
    pub collections: Vec<CollectionRestore>,
    /// Files copied into the live uploads tree, when the snapshot had one.
    pub uploads_restored: Option<usize>,
    pub config_restored: bool,
    /// Copy of the live configuration taken before it was overwritten.
    pub config_backup: Option<PathBuf>,
}

impl RestoreReport {
    pub fn documents_restored(&self) -> usize {
        self.collections.iter().map(|c| c.inserted).sum()
    }

    pub fn failed_documents(&self) -> usize {
        self.collections.iter().map(|c| c.failures.len()).sum()
    }
}

/// Restore order for the staged collections: names in `order` first, by their
/// position there, then every other name in lexical order.
pub fn plan_restore_order(staged: &[String], order: &DependencyOrder) -> Vec<String> {
    let unique: BTreeSet<&String> = staged.iter().collect();
    let (mut known, unknown): (Vec<&String>, Vec<&String>) = unique
        .into_iter()
        .partition(|name| order.position(name).is_some());
    known.sort_by_key(|name| order.position(name));
    known.into_iter().chain(unknown).cloned().collect()
}

/// Replaces each collection in `plan` with its staged documents, one collection at a time.
///
/// Every staged file is decoded before the first delete, so a malformed
/// snapshot leaves the store untouched. Empty snapshots are skipped without
/// touching the live collection. A failed delete aborts the restore;
/// per-document insert failures are recorded and the restore moves on.
pub async fn restore_collections<C: Connection>(
    conn: &C,
    staging: &Path,
    plan: &[String],
) -> Result<Vec<CollectionRestore>> {
    let mut decoded = Vec::with_capacity(plan.len());
    for name in plan {
        decoded.push((name, read_staged_collection(staging, name).await?));
    }
    debug!(collections = decoded.len(), "staged collections decoded");

    let mut restored = Vec::with_capacity(plan.len());
    for (name, documents) in decoded {
        let staged = documents.len();
        if documents.is_empty() {
            info!(collection = %name, "snapshot is empty; live collection left unchanged");
            restored.push(CollectionRestore {
                name: name.clone(),
                staged,
                deleted: 0,
                inserted: 0,
                failures: Vec::new(),
                skipped_empty: true,
            });
            continue;
        }

        let deleted = conn
            .delete_all(name)
            .await
            .context(CollectionDeleteSnafu { collection: name })?;
        let outcome = conn.insert_many(name, documents).await?;
        if outcome.failures.is_empty() {
            info!(collection = %name, deleted, inserted = outcome.inserted, "collection restored");
        } else {
            warn!(
                collection = %name,
                inserted = outcome.inserted,
                failed = outcome.failures.len(),
                "collection restored with rejected documents"
            );
        }
        restored.push(CollectionRestore {
            name: name.clone(),
            staged,
            deleted,
            inserted: outcome.inserted,
            failures: outcome.failures,
            skipped_empty: false,
        });
    }
    Ok(restored)
}

/// Result of restoring the uploads tree and configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxiliaryOutcome {
    pub uploads_restored: Option<usize>,
    pub config_restored: bool,
    pub config_backup: Option<PathBuf>,
}

/// Restores whichever of uploads and config the snapshot contains.
pub fn restore_auxiliary(
    staging: &Path,
    uploads_dir: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<AuxiliaryOutcome> {
    let mut outcome = AuxiliaryOutcome::default();

    match (staged_uploads(staging), uploads_dir) {
        (Some(staged), Some(live)) => {
            let files = copy_tree(&staged, live)?;
            info!(uploads = %live.display(), files, "uploads restored");
            outcome.uploads_restored = Some(files);
        }
        (Some(_), None) => info!("snapshot has uploads but no uploads directory is configured"),
        (None, _) => info!("snapshot has no uploads; skipped"),
    }

    match (staged_config(staging)?, config_file) {
        (Some(staged), Some(live)) => {
            outcome.config_backup = replace_config(&staged, live)?;
            outcome.config_restored = true;
        }
        (Some(_), None) => info!("snapshot has a configuration file but none is configured"),
        (None, _) => info!("snapshot has no configuration file; skipped"),
    }
    Ok(outcome)
}

/// `<config>.bak-<timestamp>` next to the live file.
pub fn config_backup_path(config_file: &Path) -> PathBuf {
    let stamp = Utc::now().format(CONFIG_BACKUP_TIMESTAMP_FORMAT);
    let name = config_file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("config");
    config_file.with_file_name(format!("{name}.bak-{stamp}"))
}

/// Saves the live config (if any), then swaps the staged copy into place.
fn replace_config(staged: &Path, live: &Path) -> Result<Option<PathBuf>> {
    let backup = match fs::metadata(live) {
        Ok(meta) if meta.is_file() => {
            let backup = config_backup_path(live);
            fs::copy(live, &backup).map_err(io_err(&backup))?;
            info!(backup = %backup.display(), "live configuration saved");
            Some(backup)
        }
        Ok(_) => None,
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => return Err(io_err(live)(err)),
    };

    let parent = live
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err(parent))?;
    fs::copy(staged, tmp.path()).map_err(io_err(staged))?;
    tmp.persist(live).map_err(|err| io_err(live)(err.error))?;
    debug!(config = %live.display(), "configuration replaced");
    Ok(backup)
}
