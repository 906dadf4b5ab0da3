use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use snapvault::prelude::{EngineConfig, Passphrase};

pub const CONFIG_FILE_NAME: &str = "snapback.json";
pub const PASSPHRASE_ENV: &str = "SNAPBACK_PASSPHRASE";

/// Contents of `snapback.json`: engine settings plus the data-store location.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub data_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl CliConfig {
    pub fn default_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("snapvault").join(CONFIG_FILE_NAME)
    }

    /// Loads `explicit`, which must exist, or the default path if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit.map_or_else(Self::default_path, Path::to_path_buf);
        if !path.exists() {
            if explicit.is_some() {
                bail!("config file {} not found", path.display());
            }
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn data_dir(&self) -> Result<&Path> {
        self.data_dir
            .as_deref()
            .context("no data directory: pass --data-dir or set data_dir in the config file")
    }
}

/// Passphrase from `file` if given, else from `SNAPBACK_PASSPHRASE`.
pub fn load_passphrase(file: Option<&Path>) -> Result<Passphrase> {
    match file {
        Some(path) => Passphrase::from_file(path)
            .with_context(|| format!("read passphrase from {}", path.display())),
        None => Passphrase::from_env(PASSPHRASE_ENV)
            .with_context(|| format!("set {PASSPHRASE_ENV} or pass --passphrase-file")),
    }
}
