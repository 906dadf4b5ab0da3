//! Engine configuration and the passphrase secret.
//!
//! `EngineConfig` is plain data: it deserializes from a JSON config file and
//! can be adjusted with chained setters. The passphrase is deliberately not
//! part of it; callers pass a [`Passphrase`] to each backup or restore call.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    DEFAULT_RETENTION,
    error::{ConfigSnafu, CryptoError, SnapshotError},
};

/// Settings for one `SnapshotEngine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `backup-*.zip.enc` artifacts and their IV sidecars.
    pub backup_dir: PathBuf,

    /// Parent directory for per-operation staging sessions.
    /// Defaults to the OS temporary directory.
    pub work_dir: Option<PathBuf>,

    /// Live uploads tree. Skipped when unset or absent.
    pub uploads_dir: Option<PathBuf>,

    /// Live configuration file. Skipped when unset or absent.
    pub config_file: Option<PathBuf>,

    /// How many artifacts survive a cleanup.
    pub retention: RetentionPolicy,

    /// Restore precedence of collections.
    pub dependency_order: DependencyOrder,

    /// Collections never captured in a snapshot.
    pub exclude_collections: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("backups"),
            work_dir: None,
            uploads_dir: None,
            config_file: None,
            retention: RetentionPolicy::default(),
            dependency_order: DependencyOrder::default(),
            exclude_collections: Vec::new(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn backup_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: dir.into(),
            ..self
        }
    }

    #[must_use]
    pub fn work_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(dir.into()),
            ..self
        }
    }

    #[must_use]
    pub fn uploads_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_dir: Some(dir.into()),
            ..self
        }
    }

    #[must_use]
    pub fn config_file(self, path: impl Into<PathBuf>) -> Self {
        Self {
            config_file: Some(path.into()),
            ..self
        }
    }

    #[must_use]
    pub fn retention(self, keep: usize) -> Self {
        Self {
            retention: RetentionPolicy::keep(keep),
            ..self
        }
    }

    #[must_use]
    pub fn dependency_order<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependency_order: DependencyOrder::new(names),
            ..self
        }
    }

    #[must_use]
    pub fn exclude_collections<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude_collections: names.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Parent directory for staging sessions.
    pub fn effective_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Loads a JSON config file. Missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, SnapshotError> {
        let text = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|err| {
            ConfigSnafu {
                message: format!("{}: {err}", path.display()),
            }
            .build()
        })
    }
}

/// Number of most recent artifacts to retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionPolicy(usize);

impl RetentionPolicy {
    pub const fn keep(n: usize) -> Self {
        Self(n)
    }

    pub const fn retained(self) -> usize {
        self.0
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self(DEFAULT_RETENTION)
    }
}

/// Ordered list of collection names: earlier entries are restored first.
///
/// Collections that reference others (employees → departments) come after the
/// collections they reference; derived or aggregate collections come last.
/// Collections not listed are restored after every listed one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyOrder(Vec<String>);

impl DependencyOrder {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// Position of `name` in the table, if listed. A name listed twice keeps its first position.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|entry| entry == name)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}

/// Operator passphrase the encryption key is derived from.
///
/// The buffer is wiped on drop and never printed.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Result<Self, CryptoError> {
        let value = Zeroizing::new(value.into());
        if value.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        Ok(Self(value))
    }

    /// Reads the passphrase from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, SnapshotError> {
        let value = std::env::var(var).map_err(|err| {
            ConfigSnafu {
                message: format!("passphrase variable {var}: {err}"),
            }
            .build()
        })?;
        Ok(Self::new(value)?)
    }

    /// Reads the passphrase from the first line of a file.
    pub fn from_file(path: &Path) -> Result<Self, SnapshotError> {
        let text = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| {
            SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?);
        let line = text.lines().next().unwrap_or_default();
        Ok(Self::new(line)?)
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(MASKED)")
    }
}
