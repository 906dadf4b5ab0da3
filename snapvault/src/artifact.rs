//! Encrypted artifacts in the backup directory and their IV sidecars.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::{
    ARTIFACT_EXTENSION, IV_SIDECAR_SUFFIX, Result,
    crypto::Iv,
    error::{
        ArtifactExistsSnafu, ArtifactNotFoundSnafu, InvalidArtifactNameSnafu, MissingIvSnafu,
        SnapshotError,
    },
    fs_util::{ensure_dir, io_err},
    layout::{ARTIFACT_PREFIX, ARTIFACT_TIMESTAMP_FORMAT, PARTIAL_SUFFIX},
};

/// One encrypted backup on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// File name, e.g. `backup-2026-03-01T09-30-00-123Z.zip.enc`.
    pub name: String,
    pub path: PathBuf,
    /// Location of the IV sidecar (it may not exist).
    pub iv_path: PathBuf,
    /// Creation time from the name, or the modification time for foreign names.
    pub created_at: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl Artifact {
    /// Reads and parses the IV sidecar.
    pub fn read_iv(&self) -> Result<Iv> {
        let text = match fs::read_to_string(&self.iv_path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return MissingIvSnafu {
                    name: &self.name,
                    path: &self.iv_path,
                }
                .fail();
            }
            Err(err) => return Err(io_err(&self.iv_path)(err)),
        };
        Ok(Iv::from_hex(&text)?)
    }

    pub fn has_iv(&self) -> bool {
        self.iv_path.is_file()
    }
}

/// Name for an artifact created at `at`.
pub fn artifact_name(at: DateTime<Utc>) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}{ARTIFACT_EXTENSION}",
        at.format(ARTIFACT_TIMESTAMP_FORMAT)
    )
}

/// Sidecar path next to `artifact_path`: `<name>.iv`.
pub fn iv_path_for(artifact_path: &Path) -> PathBuf {
    let base_name = artifact_path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("artifact");
    artifact_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{base_name}{IV_SIDECAR_SUFFIX}"))
}

/// Accepts bare file names ending in `.zip.enc`.
pub fn validate_artifact_name(name: &str) -> Result<()> {
    let message = if !name.ends_with(ARTIFACT_EXTENSION) || name.len() == ARTIFACT_EXTENSION.len()
    {
        Some(format!("expected a file name ending in {ARTIFACT_EXTENSION}"))
    } else if name.contains(['/', '\\', '\0']) || name.starts_with('.') {
        Some("expected a bare file name".to_string())
    } else {
        None
    };
    match message {
        Some(message) => InvalidArtifactNameSnafu { name, message }.fail(),
        None => Ok(()),
    }
}

fn parse_created_at(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_EXTENSION)?;
    NaiveDateTime::parse_from_str(stamp, ARTIFACT_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_utc(time: Option<SystemTime>) -> DateTime<Utc> {
    time.map_or(DateTime::UNIX_EPOCH, DateTime::<Utc>::from)
}

/// Describes the artifact `name` in `dir`.
pub fn describe(dir: &Path, name: &str) -> Result<Artifact> {
    validate_artifact_name(name)?;
    let path = dir.join(name);
    let meta = match fs::metadata(&path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return ArtifactNotFoundSnafu { name }.fail(),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return ArtifactNotFoundSnafu { name }.fail();
        }
        Err(err) => return Err(io_err(&path)(err)),
    };
    let modified = to_utc(meta.modified().ok());
    Ok(Artifact {
        name: name.to_string(),
        iv_path: iv_path_for(&path),
        created_at: parse_created_at(name).unwrap_or(modified),
        modified,
        size: meta.len(),
        path,
    })
}

/// Every artifact in `dir`, newest first. A missing directory holds no artifacts.
pub fn list_artifacts(dir: &Path) -> Result<Vec<Artifact>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(dir)(err)),
    };
    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if validate_artifact_name(&name).is_err() {
            continue;
        }
        match describe(dir, &name) {
            Ok(artifact) => artifacts.push(artifact),
            // removed between read_dir and stat, or a directory with a matching name
            Err(SnapshotError::ArtifactNotFound { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    artifacts.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(artifacts)
}

/// An artifact being written. Both files live under `.partial` names until
/// [`PendingArtifact::commit`]; dropping without committing removes them.
#[derive(Debug)]
pub struct PendingArtifact {
    dir: PathBuf,
    name: String,
    final_path: PathBuf,
    final_iv_path: PathBuf,
    partial_path: PathBuf,
    partial_iv_path: PathBuf,
    committed: bool,
}

impl PendingArtifact {
    /// Reserves the artifact name for `at` in `dir`.
    pub fn create(dir: &Path, at: DateTime<Utc>) -> Result<Self> {
        ensure_dir(dir)?;
        let name = artifact_name(at);
        let final_path = dir.join(&name);
        let final_iv_path = iv_path_for(&final_path);
        for existing in [final_path.as_path(), final_iv_path.as_path()] {
            ensure!(!existing.exists(), ArtifactExistsSnafu { path: existing });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            partial_path: dir.join(format!("{name}{PARTIAL_SUFFIX}")),
            partial_iv_path: dir.join(format!("{name}{IV_SIDECAR_SUFFIX}{PARTIAL_SUFFIX}")),
            name,
            final_path,
            final_iv_path,
            committed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens the partial ciphertext file for writing.
    pub fn ciphertext_file(&self) -> Result<fs::File> {
        fs::File::create(&self.partial_path).map_err(io_err(&self.partial_path))
    }

    /// Writes the IV sidecar, then moves both files to their final names.
    pub fn commit(mut self, iv: &Iv) -> Result<Artifact> {
        fs::write(&self.partial_iv_path, iv.to_hex()).map_err(io_err(&self.partial_iv_path))?;
        fs::rename(&self.partial_iv_path, &self.final_iv_path)
            .map_err(io_err(&self.final_iv_path))?;
        if let Err(err) = fs::rename(&self.partial_path, &self.final_path) {
            remove_if_present(&self.final_iv_path);
            return Err(io_err(&self.final_path)(err));
        }
        self.committed = true;
        debug!(artifact = %self.final_path.display(), "artifact committed");
        describe(&self.dir, &self.name)
    }
}

impl Drop for PendingArtifact {
    fn drop(&mut self) {
        if !self.committed {
            remove_if_present(&self.partial_path);
            remove_if_present(&self.partial_iv_path);
        }
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed incomplete artifact file"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove incomplete artifact file: {err}"),
    }
}
