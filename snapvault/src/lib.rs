/*
 * snapvault - encrypted system snapshot engine
 *
 * SPDX-FileCopyrightText: 2026 snapvault contributors
 * SPDX-License-Identifier: Apache-2.0
 */
//! # snapvault
//!
//! Captures the mutable state of an application (data-store collections, an
//! uploaded-files tree, and a configuration file) into a single encrypted,
//! compressed artifact, and restores it again in dependency order.
//!
//! ## Pipelines
//!
//! Backup: enumerate collections → write snapshot files to a staging
//! directory → zip (deflate, level 9) → AES-256-CBC with a fresh IV →
//! artifact + IV sidecar → retention.
//!
//! Restore: verify and decrypt → unzip into a fresh staging directory →
//! replace collections in dependency order → restore uploads and config.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapvault::prelude::*;
//! # async fn example() -> Result<(), SnapshotError> {
//!
//! let config = EngineConfig::default()
//!     .backup_dir("/var/backups/app")
//!     .uploads_dir("/srv/app/uploads")
//!     .config_file("/srv/app/config.json")
//!     .dependency_order(["departments", "employees", "epf"]);
//! let store = JsonDirStore::new("/srv/app/data");
//! let engine = SnapshotEngine::new(config, store);
//! let passphrase = Passphrase::from_env("SNAPBACK_PASSPHRASE")?;
//!
//! let outcome = engine.create_backup(&passphrase).await?;
//! println!("wrote {}", outcome.artifact.path.display());
//!
//! let report = engine.restore_backup(&outcome.artifact.name, &passphrase).await?;
//! for collection in &report.collections {
//!     println!("{} restored {}", collection.name, collection.inserted);
//! }
//! # Ok(())
//! # }
//! ```
//!
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![warn(clippy::default_trait_access)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::implicit_clone)]
#![warn(clippy::match_same_arms)]
#![warn(clippy::option_if_let_else)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::redundant_closure)]
#![warn(clippy::uninlined_format_args)]
#![warn(clippy::unnecessary_wraps)]
#![warn(clippy::unused_async)]

pub mod archive;
pub mod artifact;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod enumerator;
pub mod error;
mod fs_util;
pub mod retention;
pub mod restore;
pub mod session;
pub mod snapshot;
pub mod store;

/// Result type alias using `SnapshotError` as the default error.
pub type Result<T, E = crate::error::SnapshotError> = std::result::Result<T, E>;

/// Prelude module - import the engine and its collaborators with `use snapvault::prelude::*;`
pub mod prelude {
    pub use crate::error::*;
    pub use crate::{
        artifact::Artifact,
        config::{DependencyOrder, EngineConfig, Passphrase, RetentionPolicy},
        engine::{BackupOutcome, SnapshotEngine, VerifyReport},
        enumerator::{CollectionDescriptor, CollectionEnumerator},
        restore::{CollectionRestore, RestoreReport},
        retention::RetentionReport,
        store::{
            Connection, DataStore, Document, InsertFailure, InsertOutcome, JsonDirStore,
            MemoryStore,
        },
    };
}

// ============================================================================
// CONSTANTS
// ============================================================================

/// Extension of an encrypted backup artifact.
pub const ARTIFACT_EXTENSION: &str = ".zip.enc";

/// Suffix appended to an artifact name to form its IV sidecar name.
pub const IV_SIDECAR_SUFFIX: &str = ".iv";

/// Default number of artifacts kept by retention.
pub const DEFAULT_RETENTION: usize = 3;

pub(crate) mod layout {
    /// Artifact file names start with this prefix.
    pub const ARTIFACT_PREFIX: &str = "backup-";

    /// Timestamp embedded in artifact names (UTC).
    pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

    /// Staging sub-directory holding one JSON array per collection.
    pub const COLLECTIONS_DIR: &str = "collections";

    /// Staging sub-directory holding the uploads tree.
    pub const UPLOADS_DIR: &str = "uploads";

    /// Staging sub-directory holding the configuration file.
    pub const CONFIG_DIR: &str = "config";

    /// Snapshot manifest at the staging root.
    pub const MANIFEST_NAME: &str = "manifest.json";

    /// Extension of a collection snapshot file.
    pub const COLLECTION_FILE_EXT: &str = "json";

    /// Name of the staging directory inside a session.
    pub const STAGING_DIR: &str = "staging";

    /// Name of the intermediate plaintext archive inside a session.
    pub const SESSION_ARCHIVE: &str = "archive.zip";

    /// Suffix for files that are still being written.
    pub const PARTIAL_SUFFIX: &str = ".partial";

    /// Timestamp appended to the pre-restore copy of the configuration file.
    pub const CONFIG_BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%3f";
}
