//! Errors returned by `SnapshotEngine` and its stages
//!
use std::path::PathBuf;

use snafu::prelude::*;

/// Errors returned by snapvault
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SnapshotError {
    /// Filesystem error on a specific path (missing file, permissions, disk full).
    #[snafu(display("I/O error {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Error reading or writing a byte stream between pipeline stages.
    #[snafu(display("{stage} stream: {source}"))]
    Stream {
        stage: &'static str,
        source: std::io::Error,
    },

    /// The zip container could not be written or read.
    #[snafu(display("archive {}: {source}", path.display()))]
    Archive {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    /// An archive entry would be extracted outside the staging directory.
    #[snafu(display("archive entry {entry:?} escapes the staging directory"))]
    UnsafeArchiveEntry { entry: String },

    /// A collection snapshot file could not be serialized.
    #[snafu(display("collection {collection}: serialize snapshot: {source}"))]
    SnapshotEncode {
        collection: String,
        source: serde_json::Error,
    },

    /// A staged collection snapshot file is not a JSON array of documents.
    #[snafu(display("collection {collection}: invalid snapshot {}: {source}", path.display()))]
    SnapshotDecode {
        collection: String,
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The snapshot manifest could not be written or parsed.
    #[snafu(display("manifest {}: {source}", path.display()))]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Cryptographic failure: key derivation, IV, padding, or authentication.
    #[snafu(display("Crypto: {source}"))]
    Crypto { source: CryptoError },

    /// Error reported by the data store.
    #[snafu(display("Data store: {source}"))]
    Store { source: StoreError },

    /// Deleting the live contents of a collection failed. The restore stops here,
    /// because continuing would leave the collection partially emptied.
    #[snafu(display("restore aborted: clearing collection {collection} failed: {source}"))]
    CollectionDelete {
        collection: String,
        source: StoreError,
    },

    /// A collection name cannot be used as a snapshot file name.
    #[snafu(display("invalid collection name {name:?}"))]
    InvalidCollectionName { name: String },

    /// A requested artifact name is malformed.
    #[snafu(display("invalid backup name {name:?}: {message}"))]
    InvalidArtifactName { name: String, message: String },

    /// The requested artifact does not exist in the backup directory.
    #[snafu(display("backup {name} not found"))]
    ArtifactNotFound { name: String },

    /// The artifact exists but its IV sidecar does not, so it cannot be decrypted.
    #[snafu(display("backup {name} has no IV record at {}", path.display()))]
    MissingIv { name: String, path: PathBuf },

    /// Refusing to overwrite an existing artifact.
    #[snafu(display("backup artifact already exists: {}", path.display()))]
    ArtifactExists { path: PathBuf },

    /// Configuration error, such as a missing passphrase.
    #[snafu(display("configuration error: {message}"))]
    Config { message: String },

    /// A blocking pipeline stage panicked or was cancelled.
    #[snafu(display("pipeline task failed: {source}"))]
    Task { source: tokio::task::JoinError },
}

impl SnapshotError {
    /// True when the failure came from key/IV handling or ciphertext verification.
    pub fn is_crypto(&self) -> bool {
        matches!(self, Self::Crypto { .. })
    }
}

/// Errors from the encryption layer
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CryptoError {
    /// The passphrase is empty.
    #[snafu(display("passphrase is empty"))]
    EmptyPassphrase,

    /// The IV sidecar is not valid hex.
    #[snafu(display("IV record is not valid hex: {source}"))]
    IvEncoding { source: hex::FromHexError },

    /// The IV sidecar decodes to the wrong number of bytes.
    #[snafu(display("IV must be 16 bytes, found {len}"))]
    IvLength { len: usize },

    /// Ciphertext is too short or not a whole number of cipher blocks.
    #[snafu(display("ciphertext is truncated or malformed ({len} bytes)"))]
    Truncated { len: u64 },

    /// The integrity tag does not match: wrong passphrase, wrong IV, or a modified file.
    #[snafu(display("ciphertext authentication failed (wrong passphrase or corrupted artifact)"))]
    Authentication,

    /// The final block did not carry valid PKCS#7 padding.
    #[snafu(display("invalid padding in final cipher block"))]
    Padding,
}

/// Errors from a data-store backend
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Backend file access failed.
    #[snafu(display("store file {}: {source}", path.display()))]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A stored collection is not readable.
    #[snafu(display("collection {collection} at {} is corrupt: {source}", path.display()))]
    Corrupt {
        collection: String,
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The backend refused the operation.
    #[snafu(display("{operation} on {collection} rejected: {message}"))]
    Rejected {
        operation: &'static str,
        collection: String,
        message: String,
    },

    /// Connection could not be established or was lost.
    #[snafu(display("connection: {message}"))]
    Connection { message: String },
}

impl From<CryptoError> for SnapshotError {
    fn from(source: CryptoError) -> Self {
        Self::Crypto { source }
    }
}

impl From<StoreError> for SnapshotError {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

impl From<tokio::task::JoinError> for SnapshotError {
    fn from(source: tokio::task::JoinError) -> Self {
        Self::Task { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_errors_are_distinguishable() {
        let err: SnapshotError = CryptoError::Authentication.into();
        assert!(err.is_crypto());
        assert!(err.to_string().contains("authentication failed"));

        let err = SnapshotError::ArtifactNotFound {
            name: "backup-x.zip.enc".into(),
        };
        assert!(!err.is_crypto());
    }
}
