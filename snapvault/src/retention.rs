//! Keeps the newest N artifacts and deletes the rest.

use std::{fs, io::ErrorKind, path::Path};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    Result,
    artifact::{Artifact, list_artifacts},
    config::RetentionPolicy,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Names of the artifacts that survive, newest first.
    pub kept: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<RetentionFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionFailure {
    pub name: String,
    pub error: String,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes every artifact in `dir` beyond the newest `policy.retained()`,
/// along with its IV sidecar. Each deletion is attempted independently.
pub fn apply_retention(dir: &Path, policy: RetentionPolicy) -> Result<RetentionReport> {
    let artifacts = list_artifacts(dir)?;
    let keep = policy.retained();
    let mut report = RetentionReport::default();

    for (idx, artifact) in artifacts.into_iter().enumerate() {
        if idx < keep {
            report.kept.push(artifact.name);
            continue;
        }
        match remove_artifact(&artifact) {
            Ok(()) => {
                info!(artifact = %artifact.name, "old backup removed");
                report.removed.push(artifact.name);
            }
            Err(err) => {
                warn!(artifact = %artifact.name, "failed to remove old backup: {err}");
                report.failed.push(RetentionFailure {
                    name: artifact.name,
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// Removes the sidecar first. If that fails the ciphertext stays, so the pair
/// is still listed and the next cleanup retries it; a lone `.iv` would never be
/// listed again.
fn remove_artifact(artifact: &Artifact) -> std::io::Result<()> {
    match fs::remove_file(&artifact.iv_path) {
        Err(err) if err.kind() != ErrorKind::NotFound => return Err(err),
        _ => {}
    }
    fs::remove_file(&artifact.path)
}
