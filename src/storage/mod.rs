//! Content-addressed blob storage abstraction.
//!
//! The [`BlobStore`] trait defines the operations the knowledge manager
//! needs from raw byte storage, keyed by content checksum, enabling
//! pluggable backends (local filesystem, S3-compatible object storage).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! `store` is an idempotent overwrite; `delete` is a no-op when the blob
//! is absent. Exactly one blob exists per checksum no matter how many
//! knowledge entries reference it.

pub mod local;
pub mod s3;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StorageConfig;

/// Blob store failure, split so callers can map `NotFound` to a
/// 404-equivalent and everything else to a 500-equivalent.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No blob exists under the requested checksum.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote backend failure (network, auth, or non-success response).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Descriptive metadata stored alongside a blob (file name, content type).
pub type BlobMetadata = BTreeMap<String, String>;

/// Abstract content-addressed blob storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`store`](BlobStore::store) | Write a blob under a checksum (idempotent overwrite) |
/// | [`fetch`](BlobStore::fetch) | Read a blob and its metadata back |
/// | [`delete`](BlobStore::delete) | Remove a blob (no-op when absent) |
/// | [`delete_all`](BlobStore::delete_all) | Bulk-clear the backend (administrative/test use) |
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `checksum`, overwriting any existing blob.
    async fn store(
        &self,
        checksum: &str,
        bytes: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<(), StorageError>;

    /// Fetch the blob and metadata stored under `checksum`.
    async fn fetch(&self, checksum: &str) -> Result<(Vec<u8>, BlobMetadata), StorageError>;

    /// Delete the blob stored under `checksum`, if present.
    async fn delete(&self, checksum: &str) -> Result<(), StorageError>;

    /// Delete every blob in the backend.
    async fn delete_all(&self) -> Result<(), StorageError>;
}

/// Resolve the configured blob store backend.
pub fn from_config(config: &StorageConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.backend.as_str() {
        "local" => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.root is required for the local backend"))?;
            Ok(Arc::new(local::LocalBlobStore::new(root)))
        }
        "s3" => {
            let s3_config = config
                .s3
                .clone()
                .ok_or_else(|| anyhow::anyhow!("[storage.s3] is required for the s3 backend"))?;
            Ok(Arc::new(s3::S3BlobStore::from_env(s3_config)?))
        }
        other => anyhow::bail!("Unknown storage backend: '{}'. Must be local or s3.", other),
    }
}
