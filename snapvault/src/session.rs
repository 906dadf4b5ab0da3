//! Per-operation staging area.
//!
//! Every backup or restore gets its own uniquely named directory under the
//! configured work dir. It holds the unencrypted snapshot (`staging/`) and the
//! intermediate plaintext archive, and is removed when the session is dropped:
//! on success, on error, and when the owning task is cancelled.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{
    Result,
    fs_util::{ensure_dir, io_err},
    layout::{SESSION_ARCHIVE, STAGING_DIR},
};

#[derive(Debug)]
pub struct StagingSession {
    dir: Option<TempDir>,
    staging: PathBuf,
    archive: PathBuf,
}

impl StagingSession {
    /// Creates `<work_dir>/snapvault-<kind>-XXXXXX/staging`.
    pub fn create(work_dir: &Path, kind: &str) -> Result<Self> {
        ensure_dir(work_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("snapvault-{kind}-"))
            .tempdir_in(work_dir)
            .map_err(io_err(work_dir))?;
        let staging = dir.path().join(STAGING_DIR);
        ensure_dir(&staging)?;
        let archive = dir.path().join(SESSION_ARCHIVE);
        debug!(session = %dir.path().display(), "staging session created");
        Ok(Self {
            dir: Some(dir),
            staging,
            archive,
        })
    }

    /// Root of the unencrypted snapshot layout.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Path of the plaintext archive for this session.
    pub fn archive_path(&self) -> &Path {
        &self.archive
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }
}

impl Drop for StagingSession {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(session = %path.display(), "staging session removed"),
                Err(err) => warn!(session = %path.display(), "failed to remove staging session: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_distinct_and_removed_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let first = StagingSession::create(temp.path(), "backup").unwrap();
        let second = StagingSession::create(temp.path(), "backup").unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.staging_dir().is_dir());

        std::fs::write(first.staging_dir().join("x.json"), b"[]").unwrap();
        let root = first.path().unwrap().to_path_buf();
        drop(first);
        assert!(!root.exists());
        drop(second);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
