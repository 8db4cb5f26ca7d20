//! Local filesystem blob store.
//!
//! Each blob lives at `<root>/<checksum>` with its metadata map in a
//! `<checksum>.meta.json` sidecar. Both files are rewritten on `store`,
//! which makes the overwrite idempotent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{BlobMetadata, BlobStore, StorageError};

const META_SUFFIX: &str = ".meta.json";

/// Filesystem-backed [`BlobStore`].
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn blob_path(&self, checksum: &str) -> PathBuf {
        self.root.join(checksum)
    }

    fn meta_path(&self, checksum: &str) -> PathBuf {
        self.root.join(format!("{}{}", checksum, META_SUFFIX))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(
        &self,
        checksum: &str,
        bytes: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.blob_path(checksum), bytes).await?;
        let meta_json = serde_json::to_vec(metadata)
            .map_err(|e| StorageError::Backend(format!("failed to encode metadata: {}", e)))?;
        tokio::fs::write(self.meta_path(checksum), meta_json).await?;
        Ok(())
    }

    async fn fetch(&self, checksum: &str) -> Result<(Vec<u8>, BlobMetadata), StorageError> {
        let bytes = match tokio::fs::read(self.blob_path(checksum)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(checksum.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        // A missing sidecar is tolerated; the blob itself is authoritative.
        let metadata = match tokio::fs::read(self.meta_path(checksum)).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok((bytes, metadata))
    }

    async fn delete(&self, checksum: &str) -> Result<(), StorageError> {
        for path in [self.blob_path(checksum), self.meta_path(checksum)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}
