//! Knowledge Manager — orchestration across the index, blob store,
//! vector store, and ingestion dispatch.
//!
//! Relational mutations run inside short transactions owned by the
//! [`KnowledgeIndex`]; blob and vector mutations are best-effort steps
//! outside those transactions, with no distributed coordination. Within
//! `delete_knowledge`/`update_source`, vector-embedding removal is issued
//! before blob removal, which is issued before the index mutation, so a
//! mid-sequence crash strands at worst an orphaned blob or orphaned
//! embeddings rather than an index row pointing at removed artifacts.
//!
//! The checksum dedup check-then-act (`count_by_checksum` then conditional
//! `store`) is not atomic across concurrent identical uploads; the
//! idempotent blob overwrite makes the race harmless. This is a known,
//! accepted race.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::{KbError, Result};
use crate::index::KnowledgeIndex;
use crate::ingest::{IngestDocument, IngestionDispatcher};
use crate::models::{IngestionStatus, Knowledge, KnowledgeSource};
use crate::permission::{is_valid_username, permissions_to_token, Permission};
use crate::storage::{BlobMetadata, BlobStore, StorageError};
use crate::vector::{EmbeddingMetadata, VectorHit, VectorStore};

/// Compute the hex-encoded SHA-256 content checksum of an upload.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Orchestrator for all knowledge mutations.
pub struct KnowledgeManager {
    index: KnowledgeIndex,
    blobs: Arc<dyn BlobStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    dispatcher: Arc<dyn IngestionDispatcher>,
}

impl KnowledgeManager {
    pub fn new(
        index: KnowledgeIndex,
        blobs: Arc<dyn BlobStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        dispatcher: Arc<dyn IngestionDispatcher>,
    ) -> Self {
        Self {
            index,
            blobs,
            vectors,
            embedder,
            dispatcher,
        }
    }

    /// Register a new source document with no initial grants.
    ///
    /// Returns the new knowledge id with status `Pending`; ingestion runs
    /// asynchronously.
    pub async fn add_source(
        &self,
        file: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<String> {
        self.add_source_inner(BTreeMap::new(), file, file_name, content_type)
            .await
    }

    /// Register a new source document, granting `owner` the `Owner`
    /// capability. This is the only point where `Owner` can be assigned.
    pub async fn add_source_for_owner(
        &self,
        owner: &str,
        file: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<String> {
        let mut permissions = BTreeMap::new();
        permissions.insert(owner.to_string(), Permission::Owner);
        self.add_source_inner(permissions, file, file_name, content_type)
            .await
    }

    async fn add_source_inner(
        &self,
        permissions: BTreeMap<String, Permission>,
        file: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<String> {
        if file.is_empty() {
            return Err(KbError::EmptyFile);
        }

        let checksum = checksum_bytes(file);
        let now = Utc::now().timestamp();
        let knowledge = Knowledge {
            id: Uuid::new_v4().to_string(),
            checksum: checksum.clone(),
            content_type: content_type.to_string(),
            status: IngestionStatus::Pending,
            token_count: None,
            created_at: now,
            last_updated_at: now,
            label: None,
            tags: Default::default(),
            permissions,
            source: KnowledgeSource::File {
                file_name: file_name.to_string(),
            },
        };

        // Dedup check before insert: a sibling row sharing the checksum
        // means the blob already exists.
        let shared = self.index.count_by_checksum(&checksum).await? > 0;
        self.index.insert(&knowledge).await?;

        if !shared {
            self.blobs
                .store(&checksum, file, &blob_metadata(file_name, content_type))
                .await?;
        } else {
            debug!(checksum = %checksum, "blob already stored, skipping write");
        }

        self.dispatch_ingestion(&knowledge, file).await?;
        info!(id = %knowledge.id, checksum = %checksum, "added knowledge source");
        Ok(knowledge.id)
    }

    /// Replace the source document of an existing entry.
    ///
    /// A new checksum equal to the old one is a successful no-op: no
    /// re-ingestion, no blob or embedding churn.
    pub async fn update_source(
        &self,
        id: &str,
        file: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<()> {
        let knowledge = self.require(id).await?;
        if file.is_empty() {
            return Err(KbError::EmptyFile);
        }

        let new_checksum = checksum_bytes(file);
        if new_checksum == knowledge.checksum {
            debug!(id = %id, "source content unchanged, skipping update");
            return Ok(());
        }

        // Only this record references the old checksum: the blob goes too.
        if self.index.count_by_checksum(&knowledge.checksum).await? == 1 {
            self.blobs.delete(&knowledge.checksum).await?;
        }
        self.vectors.remove_by_knowledge_id(id).await?;

        self.index
            .update_source(id, &new_checksum, file_name, content_type)
            .await?;
        self.blobs
            .store(&new_checksum, file, &blob_metadata(file_name, content_type))
            .await?;

        let mut updated = knowledge;
        updated.checksum = new_checksum;
        updated.content_type = content_type.to_string();
        updated.source = KnowledgeSource::File {
            file_name: file_name.to_string(),
        };
        self.dispatch_ingestion(&updated, file).await?;
        info!(id = %id, checksum = %updated.checksum, "updated knowledge source");
        Ok(())
    }

    /// Delete an entry, its embeddings, and — when unshared — its blob.
    pub async fn delete_knowledge(&self, id: &str) -> Result<()> {
        let knowledge = self.require(id).await?;

        self.vectors.remove_by_knowledge_id(id).await?;
        if self.index.count_by_checksum(&knowledge.checksum).await? == 1 {
            self.blobs.delete(&knowledge.checksum).await?;
        }
        self.index.delete(id).await?;
        info!(id = %id, "deleted knowledge");
        Ok(())
    }

    /// Grant `permission` to `username` and re-project the permission
    /// token into the vector store.
    pub async fn set_permission(
        &self,
        id: &str,
        username: &str,
        permission: Permission,
    ) -> Result<()> {
        let mut knowledge = self.require(id).await?;

        if permission == Permission::None {
            return Err(KbError::IllegalPermissionModification(
                "NONE cannot be assigned; remove the grant instead".to_string(),
            ));
        }
        if permission == Permission::Owner {
            return Err(KbError::IllegalPermissionModification(
                "OWNER may only be assigned at creation".to_string(),
            ));
        }
        if !is_valid_username(username) {
            return Err(KbError::IllegalPermissionModification(format!(
                "invalid username '{}'",
                username
            )));
        }
        if knowledge.status != IngestionStatus::Succeeded {
            return Err(KbError::IllegalPermissionModification(
                "permissions can only change after ingestion succeeded".to_string(),
            ));
        }

        let current = knowledge.permissions.get(username).copied();
        if current == Some(Permission::Owner) {
            return Err(KbError::IllegalPermissionModification(format!(
                "'{}' holds OWNER, which cannot be changed",
                username
            )));
        }
        if current == Some(permission) {
            debug!(id = %id, username = %username, "permission unchanged, skipping");
            return Ok(());
        }

        knowledge
            .permissions
            .insert(username.to_string(), permission);
        self.index.set_permissions(id, &knowledge.permissions).await?;
        self.project_permissions(&knowledge).await?;
        info!(id = %id, username = %username, permission = %permission, "granted permission");
        Ok(())
    }

    /// Revoke `username`'s grant (the only path down to NONE) and
    /// re-project the token. Removing an absent grant is a no-op.
    pub async fn remove_permission(&self, id: &str, username: &str) -> Result<()> {
        let mut knowledge = self.require(id).await?;

        if knowledge.status != IngestionStatus::Succeeded {
            return Err(KbError::IllegalPermissionModification(
                "permissions can only change after ingestion succeeded".to_string(),
            ));
        }
        if knowledge.permissions.get(username) == Some(&Permission::Owner) {
            return Err(KbError::IllegalPermissionModification(format!(
                "'{}' holds OWNER, which cannot be removed",
                username
            )));
        }
        if knowledge.permissions.remove(username).is_none() {
            return Ok(());
        }

        self.index.set_permissions(id, &knowledge.permissions).await?;
        self.project_permissions(&knowledge).await?;
        info!(id = %id, username = %username, "revoked permission");
        Ok(())
    }

    pub async fn add_tag(&self, id: &str, tag: &str) -> Result<()> {
        let mut knowledge = self.require(id).await?;
        if knowledge.tags.insert(tag.to_string()) {
            self.index.set_tags(id, &knowledge.tags).await?;
        }
        Ok(())
    }

    pub async fn remove_tag(&self, id: &str, tag: &str) -> Result<()> {
        let mut knowledge = self.require(id).await?;
        if knowledge.tags.remove(tag) {
            self.index.set_tags(id, &knowledge.tags).await?;
        }
        Ok(())
    }

    pub async fn set_label(&self, id: &str, label: Option<&str>) -> Result<()> {
        self.require(id).await?;
        self.index.set_label(id, label).await
    }

    /// Fetch the stored source bytes and metadata for an entry.
    ///
    /// A missing blob for a referenced checksum means a prior invariant
    /// violation; it is reported as an internal-consistency fault, not as
    /// a not-found.
    pub async fn get_file(&self, id: &str) -> Result<(String, Vec<u8>, BlobMetadata)> {
        let knowledge = self.require(id).await?;
        let (bytes, metadata) = self.fetch_blob_checked(&knowledge).await?;
        Ok((knowledge.source.file_name().to_string(), bytes, metadata))
    }

    /// Re-dispatch ingestion for an entry stuck in `Failed`.
    ///
    /// A no-op (no side effects) for any other status.
    pub async fn retry_failed_ingestion(&self, id: &str) -> Result<()> {
        let knowledge = self.require(id).await?;
        if knowledge.status != IngestionStatus::Failed {
            debug!(id = %id, status = %knowledge.status.as_str(), "retry skipped");
            return Ok(());
        }

        let (bytes, _) = self.fetch_blob_checked(&knowledge).await?;
        self.index.set_status(id, IngestionStatus::Pending).await?;
        self.dispatch_ingestion(&knowledge, &bytes).await?;
        info!(id = %id, "retrying failed ingestion");
        Ok(())
    }

    pub async fn get_knowledge(&self, id: &str) -> Result<Option<Knowledge>> {
        self.index.find_by_id(id).await
    }

    pub async fn list_knowledge(&self) -> Result<Vec<Knowledge>> {
        self.index.list_all().await
    }

    /// Entries visible to a username (own + public), or public only for
    /// `None`.
    pub async fn list_visible(&self, username: Option<&str>) -> Result<Vec<Knowledge>> {
        self.index.list_for_username(username).await
    }

    /// Similarity search scoped by a permission query token.
    pub async fn search(
        &self,
        query: &str,
        permission_token: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .into_iter()
            .next()
            .ok_or_else(|| KbError::Internal("embedder returned no vector".to_string()))?;
        self.vectors.search(&query_vec, permission_token, limit).await
    }

    async fn require(&self, id: &str) -> Result<Knowledge> {
        self.index
            .find_by_id(id)
            .await?
            .ok_or(KbError::KnowledgeNotFound)
    }

    async fn fetch_blob_checked(&self, knowledge: &Knowledge) -> Result<(Vec<u8>, BlobMetadata)> {
        match self.blobs.fetch(&knowledge.checksum).await {
            Ok(found) => Ok(found),
            Err(StorageError::NotFound(checksum)) => {
                error!(
                    id = %knowledge.id,
                    checksum = %checksum,
                    "blob missing for referenced checksum"
                );
                Err(KbError::Internal(format!(
                    "blob missing for referenced checksum {}",
                    checksum
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn project_permissions(&self, knowledge: &Knowledge) -> Result<()> {
        let token = permissions_to_token(&knowledge.permissions);
        self.vectors
            .update_permission_token(&knowledge.id, &token)
            .await
    }

    async fn dispatch_ingestion(&self, knowledge: &Knowledge, file: &[u8]) -> Result<()> {
        let document = IngestDocument {
            knowledge_id: knowledge.id.clone(),
            text: String::from_utf8_lossy(file).into_owned(),
        };
        let metadata = EmbeddingMetadata {
            knowledge_id: knowledge.id.clone(),
            checksum: knowledge.checksum.clone(),
            content_type: knowledge.content_type.clone(),
            permission_token: permissions_to_token(&knowledge.permissions),
        };
        self.dispatcher.dispatch(document, metadata).await
    }
}

fn blob_metadata(file_name: &str, content_type: &str) -> BlobMetadata {
    let mut metadata = BlobMetadata::new();
    metadata.insert("file_name".to_string(), file_name.to_string());
    metadata.insert("content_type".to_string(), content_type.to_string());
    metadata
}
