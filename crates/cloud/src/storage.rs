//! Storage provider trait and shared error type.

use std::path::Path;

use async_trait::async_trait;

/// Errors from the bulk storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("Storage request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The storage server answered with an unexpected status code.
    #[error("Storage error ({status}) for {path}: {body}")]
    Api {
        status: u16,
        path: String,
        body: String,
    },

    /// The configured share URL cannot have a path appended.
    #[error("Invalid storage URL: {0}")]
    InvalidUrl(String),

    /// Reading or writing the local side of a transfer failed.
    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote object store holding durable outputs.
///
/// Paths are absolute remote paths such as `/crowdsky/stacks/user_1/M_31`.
#[async_trait]
pub trait BulkStorage: Send + Sync {
    /// Create `remote_dir` and all missing parents.
    ///
    /// Succeeds when the directory already exists.
    async fn create_dir(&self, remote_dir: &str) -> Result<(), StorageError>;

    /// Upload a local file to `remote_path`.
    async fn put_object(&self, local: &Path, remote_path: &str) -> Result<(), StorageError>;

    /// Download `remote_path` into `local`, creating parent directories.
    async fn get_object(&self, remote_path: &str, local: &Path) -> Result<(), StorageError>;

    /// Delete `remote_path`. A missing object counts as deleted.
    async fn delete_object(&self, remote_path: &str) -> Result<(), StorageError>;
}
