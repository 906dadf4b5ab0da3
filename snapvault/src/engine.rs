//! `SnapshotEngine`: the backup, restore, download, and cleanup operations.
//!
//! Each operation runs in its own staging session and, where it needs the data
//! store, holds exactly one connection that is closed before returning.
//! CPU-bound and blocking stages (zip, cipher, file copies) run on tokio's
//! blocking pool.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::{
    Result,
    archive::{self, ArchiveFileEntry},
    artifact::{self, Artifact, PendingArtifact},
    config::{EngineConfig, Passphrase},
    crypto::{self, ArtifactKey, Iv},
    enumerator::CollectionEnumerator,
    fs_util::io_err,
    restore::{self, RestoreReport},
    retention::{RetentionReport, apply_retention},
    session::StagingSession,
    snapshot::{self, CollectionEntry, Manifest},
    store::{Connection, DataStore},
};

/// Result of a successful `create_backup`.
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub artifact: Artifact,
    pub collections: Vec<CollectionEntry>,
    pub uploads_included: bool,
    pub config_included: bool,
    /// Cleanup that ran after the artifact was written. `None` if it could not run.
    pub retention: Option<RetentionReport>,
}

impl BackupOutcome {
    pub fn document_count(&self) -> usize {
        self.collections.iter().map(|c| c.documents).sum()
    }
}

/// Result of `verify_backup`: the artifact decrypts and unpacks cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub artifact: Artifact,
    pub manifest: Option<Manifest>,
    pub entries: Vec<ArchiveFileEntry>,
    /// Size of the decrypted archive.
    pub archive_bytes: u64,
}

/// Snapshot engine bound to one configuration and one data store.
#[derive(Debug)]
pub struct SnapshotEngine<S> {
    config: EngineConfig,
    store: S,
}

impl<S: DataStore> SnapshotEngine<S> {
    pub fn new(config: EngineConfig, store: S) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Captures every collection, the uploads tree, and the configuration file
    /// into a new encrypted artifact, then applies retention.
    ///
    /// Nothing is left in the backup directory if any stage fails.
    pub async fn create_backup(&self, passphrase: &Passphrase) -> Result<BackupOutcome> {
        let key = ArtifactKey::derive(passphrase);
        let session = StagingSession::create(&self.config.effective_work_dir(), "backup")?;
        let staging = session.staging_dir().to_path_buf();

        let enumerator = CollectionEnumerator::new(self.config.exclude_collections.iter().cloned());
        let conn = ConnectionGuard::new(self.store.connect().await?);
        let snapshot = async {
            let descriptors = enumerator.enumerate(conn.get()).await?;
            info!(collections = descriptors.len(), "collections enumerated");
            snapshot::write_collections(conn.get(), &staging, &descriptors).await
        }
        .await;
        let collections = conn.release(snapshot).await?;

        let uploads_dir = self.config.uploads_dir.clone();
        let config_file = self.config.config_file.clone();
        let backup_dir = self.config.backup_dir.clone();
        let (artifact, manifest) = spawn_blocking(move || {
            let uploads_included =
                snapshot::stage_uploads(&staging, uploads_dir.as_deref())?.is_some();
            let config_name = snapshot::stage_config(&staging, config_file.as_deref())?;

            let mut manifest = Manifest::new(collections);
            manifest.uploads_included = uploads_included;
            manifest.config_included = config_name.is_some();
            manifest.config_file_name = config_name;
            manifest.write(&staging)?;

            archive::pack_dir(&staging, session.archive_path())?;
            let artifact = seal_archive(&key, session.archive_path(), &backup_dir)?;
            drop(session);
            Ok::<_, crate::error::SnapshotError>((artifact, manifest))
        })
        .await??;
        info!(
            artifact = %artifact.name,
            bytes = artifact.size,
            documents = manifest.document_count(),
            "backup created"
        );

        let retention = match self.cleanup_old_backups().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!("retention after backup failed: {err}");
                None
            }
        };

        Ok(BackupOutcome {
            artifact,
            collections: manifest.collections,
            uploads_included: manifest.uploads_included,
            config_included: manifest.config_included,
            retention,
        })
    }

    /// Replaces live state with the contents of artifact `name`.
    ///
    /// The artifact and its IV are checked before the data store is contacted.
    pub async fn restore_backup(&self, name: &str, passphrase: &Passphrase) -> Result<RestoreReport> {
        let artifact = artifact::describe(&self.config.backup_dir, name)?;
        let iv = artifact.read_iv()?;
        let key = ArtifactKey::derive(passphrase);
        let session = StagingSession::create(&self.config.effective_work_dir(), "restore")?;

        let (session, manifest) = {
            let path = artifact.path.clone();
            spawn_blocking(move || {
                open_archive(&key, &iv, &path, &session)?;
                let manifest = Manifest::read(session.staging_dir())?;
                Ok::<_, crate::error::SnapshotError>((session, manifest))
            })
            .await??
        };
        let staging = session.staging_dir().to_path_buf();
        if let Some(manifest) = &manifest {
            info!(
                created_at = %manifest.created_at,
                tool = %manifest.tool,
                collections = manifest.collections.len(),
                "restoring snapshot"
            );
        }

        let staged = snapshot::staged_collections(&staging)?;
        let plan = restore::plan_restore_order(&staged, &self.config.dependency_order);
        debug!(?plan, "restore order");

        let conn = ConnectionGuard::new(self.store.connect().await?);
        let restored = restore::restore_collections(conn.get(), &staging, &plan).await;
        let collections = conn.release(restored).await?;

        let uploads_dir = self.config.uploads_dir.clone();
        let config_file = self.config.config_file.clone();
        let auxiliary = spawn_blocking(move || {
            let outcome =
                restore::restore_auxiliary(&staging, uploads_dir.as_deref(), config_file.as_deref());
            drop(session);
            outcome
        })
        .await??;

        let report = RestoreReport {
            artifact: artifact.name,
            collections,
            uploads_restored: auxiliary.uploads_restored,
            config_restored: auxiliary.config_restored,
            config_backup: auxiliary.config_backup,
        };
        info!(
            artifact = %report.artifact,
            documents = report.documents_restored(),
            failed = report.failed_documents(),
            "restore finished"
        );
        Ok(report)
    }

    /// Applies the retention policy to the backup directory.
    pub async fn cleanup_old_backups(&self) -> Result<RetentionReport> {
        let dir = self.config.backup_dir.clone();
        let policy = self.config.retention;
        let report = spawn_blocking(move || apply_retention(&dir, policy)).await??;
        debug!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "retention applied"
        );
        Ok(report)
    }

    /// Opens artifact `name` for streaming to a client, without decrypting it.
    pub async fn open_artifact(&self, name: &str) -> Result<(Artifact, tokio::fs::File)> {
        let artifact = artifact::describe(&self.config.backup_dir, name)?;
        let file = tokio::fs::File::open(&artifact.path)
            .await
            .map_err(io_err(&artifact.path))?;
        Ok((artifact, file))
    }

    /// Artifacts in the backup directory, newest first.
    pub fn list_backups(&self) -> Result<Vec<Artifact>> {
        artifact::list_artifacts(&self.config.backup_dir)
    }

    /// Decrypts and unpacks artifact `name` into a scratch session without
    /// touching the data store or live files.
    pub async fn verify_backup(&self, name: &str, passphrase: &Passphrase) -> Result<VerifyReport> {
        let artifact = artifact::describe(&self.config.backup_dir, name)?;
        let iv = artifact.read_iv()?;
        let key = ArtifactKey::derive(passphrase);
        let session = StagingSession::create(&self.config.effective_work_dir(), "verify")?;

        let path = artifact.path.clone();
        let (manifest, entries, archive_bytes) = spawn_blocking(move || {
            let archive_bytes = open_archive(&key, &iv, &path, &session)?;
            let entries = archive::list_entries(session.archive_path())?;
            let manifest = Manifest::read(session.staging_dir())?;
            Ok::<_, crate::error::SnapshotError>((manifest, entries, archive_bytes))
        })
        .await??;
        info!(artifact = %artifact.name, entries = entries.len(), "backup verified");
        Ok(VerifyReport {
            artifact,
            manifest,
            entries,
            archive_bytes,
        })
    }
}

/// Holds the connection of one operation. If the operation future is dropped
/// before [`ConnectionGuard::release`], the connection is closed on a
/// background task of the current runtime.
struct ConnectionGuard<C: Connection + 'static> {
    conn: Option<C>,
}

impl<C: Connection + 'static> ConnectionGuard<C> {
    fn new(conn: C) -> Self {
        Self { conn: Some(conn) }
    }

    fn get(&self) -> &C {
        // only `release` takes the connection, and it consumes the guard
        self.conn.as_ref().expect("connection is held until release")
    }

    /// Closes the connection and passes `result` through. A close failure is
    /// logged and never replaces the operation's own result.
    async fn release<T>(mut self, result: Result<T>) -> Result<T> {
        if let Some(conn) = self.conn.take()
            && let Err(err) = conn.close().await
        {
            warn!("failed to close data-store connection: {err}");
        }
        result
    }
}

impl<C: Connection + 'static> Drop for ConnectionGuard<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("operation cancelled; closing data-store connection in the background");
                handle.spawn(async move {
                    if let Err(err) = conn.close().await {
                        warn!("failed to close data-store connection: {err}");
                    }
                });
            }
            Err(_) => warn!("operation cancelled outside a runtime; data-store connection dropped unclosed"),
        }
    }
}

/// Encrypts the plaintext archive into a new artifact in `backup_dir`.
fn seal_archive(key: &ArtifactKey, archive_path: &Path, backup_dir: &Path) -> Result<Artifact> {
    let pending = PendingArtifact::create(backup_dir, Utc::now())?;
    let partial = pending.ciphertext_file()?;
    let iv = Iv::random();
    let reader = BufReader::new(File::open(archive_path).map_err(io_err(archive_path))?);
    let mut writer = BufWriter::new(partial);
    crypto::encrypt_stream(key, &iv, reader, &mut writer)?;
    let dest = backup_dir.join(pending.name());
    writer.flush().map_err(io_err(&dest))?;
    writer.get_ref().sync_all().map_err(io_err(&dest))?;
    drop(writer);
    pending.commit(&iv)
}

/// Decrypts `artifact_path` into the session archive and unpacks it into staging.
/// Returns the archive size.
fn open_archive(
    key: &ArtifactKey,
    iv: &Iv,
    artifact_path: &Path,
    session: &StagingSession,
) -> Result<u64> {
    let archive_path: PathBuf = session.archive_path().to_path_buf();
    let out = File::create(&archive_path).map_err(io_err(&archive_path))?;
    let bytes = crypto::decrypt_file(key, iv, artifact_path, BufWriter::new(out))?;
    archive::unpack(&archive_path, session.staging_dir())?;
    Ok(bytes)
}
