//! Integration tests for the knowledge manager: dedup, store consistency
//! across mutations, permission projection, and the ingestion lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use kbase::db;
use kbase::embedding::{Embedder, HashEmbedder};
use kbase::error::KbError;
use kbase::index::KnowledgeIndex;
use kbase::ingest::{IngestionDispatcher, LocalDispatcher};
use kbase::manager::{checksum_bytes, KnowledgeManager};
use kbase::migrate;
use kbase::models::IngestionStatus;
use kbase::permission::Permission;
use kbase::storage::{BlobMetadata, BlobStore, StorageError};
use kbase::vector::{InMemoryVectorStore, VectorStore};

/// Blob store wrapper counting `store` calls, to observe dedup skips.
struct CountingBlobStore {
    inner: Arc<dyn BlobStore>,
    stores: AtomicUsize,
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn store(
        &self,
        checksum: &str,
        bytes: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<(), StorageError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(checksum, bytes, metadata).await
    }

    async fn fetch(&self, checksum: &str) -> Result<(Vec<u8>, BlobMetadata), StorageError> {
        self.inner.fetch(checksum).await
    }

    async fn delete(&self, checksum: &str) -> Result<(), StorageError> {
        self.inner.delete(checksum).await
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        self.inner.delete_all().await
    }
}

struct Harness {
    _dir: TempDir,
    blob_root: PathBuf,
    index: KnowledgeIndex,
    vectors: Arc<InMemoryVectorStore>,
    dispatcher: Arc<LocalDispatcher>,
    store_calls: Arc<CountingBlobStore>,
    manager: KnowledgeManager,
}

impl Harness {
    fn blob_path(&self, checksum: &str) -> PathBuf {
        self.blob_root.join(checksum)
    }

    fn store_count(&self) -> usize {
        self.store_calls.stores.load(Ordering::SeqCst)
    }

    /// Add a document as `owner` and wait for ingestion to settle.
    async fn add_settled(&self, owner: &str, bytes: &[u8], file_name: &str) -> String {
        let id = self
            .manager
            .add_source_for_owner(owner, bytes, file_name, "text/plain")
            .await
            .unwrap();
        self.dispatcher.drain().await;
        id
    }
}

async fn harness() -> Harness {
    harness_with_embedder(Arc::new(HashEmbedder::new(32))).await
}

async fn harness_with_embedder(embedder: Arc<dyn Embedder>) -> Harness {
    let dir = TempDir::new().unwrap();
    let pool = db::connect(&dir.path().join("kb.db")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let index = KnowledgeIndex::new(pool);
    let blob_root = dir.path().join("blobs");
    let store_calls = Arc::new(CountingBlobStore {
        inner: Arc::new(kbase::storage::local::LocalBlobStore::new(blob_root.clone())),
        stores: AtomicUsize::new(0),
    });
    let vectors = Arc::new(InMemoryVectorStore::new());
    let dispatcher = Arc::new(LocalDispatcher::new(
        index.clone(),
        Arc::clone(&vectors) as Arc<dyn VectorStore>,
        Arc::clone(&embedder),
        100,
    ));
    let manager = KnowledgeManager::new(
        index.clone(),
        Arc::clone(&store_calls) as Arc<dyn BlobStore>,
        Arc::clone(&vectors) as Arc<dyn VectorStore>,
        embedder,
        Arc::clone(&dispatcher) as Arc<dyn IngestionDispatcher>,
    );

    Harness {
        _dir: dir,
        blob_root,
        index,
        vectors,
        dispatcher,
        store_calls,
        manager,
    }
}

#[tokio::test]
async fn test_add_source_ingests_to_succeeded() {
    let h = harness().await;
    let id = h.add_settled("alice", b"deployment runbook for the api", "runbook.txt").await;

    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(k.status, IngestionStatus::Succeeded);
    assert!(k.token_count.is_some());
    assert_eq!(k.owner(), Some("alice"));
    assert!(h.blob_path(&k.checksum).exists());
    assert!(h.vectors.count_by_knowledge_id(&id).await.unwrap() > 0);
}

#[tokio::test]
async fn test_add_source_rejects_empty_file() {
    let h = harness().await;
    let err = h
        .manager
        .add_source_for_owner("alice", b"", "empty.txt", "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::EmptyFile));
}

#[tokio::test]
async fn test_duplicate_content_stores_blob_once() {
    let h = harness().await;
    let bytes = b"identical content uploaded twice";
    let id1 = h.add_settled("alice", bytes, "a.txt").await;
    let id2 = h.add_settled("bob", bytes, "b.txt").await;

    assert_ne!(id1, id2);
    assert_eq!(h.store_count(), 1);
    assert_eq!(
        h.index.count_by_checksum(&checksum_bytes(bytes)).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_delete_keeps_shared_blob_until_last_reference() {
    let h = harness().await;
    let bytes = b"shared bytes";
    let checksum = checksum_bytes(bytes);
    let id1 = h.add_settled("alice", bytes, "a.txt").await;
    let id2 = h.add_settled("bob", bytes, "b.txt").await;

    h.manager.delete_knowledge(&id1).await.unwrap();
    assert!(h.blob_path(&checksum).exists());
    assert_eq!(h.vectors.count_by_knowledge_id(&id1).await.unwrap(), 0);
    assert!(h.manager.get_knowledge(&id1).await.unwrap().is_none());

    h.manager.delete_knowledge(&id2).await.unwrap();
    assert!(!h.blob_path(&checksum).exists());
}

#[tokio::test]
async fn test_update_source_with_unchanged_content_is_noop() {
    let h = harness().await;
    let bytes = b"stable content";
    let id = h.add_settled("alice", bytes, "a.txt").await;
    let stores_before = h.store_count();

    h.manager
        .update_source(&id, bytes, "renamed.txt", "text/plain")
        .await
        .unwrap();
    h.dispatcher.drain().await;

    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    // No re-ingestion and no blob churn; even the file name is untouched.
    assert_eq!(h.store_count(), stores_before);
    assert_eq!(k.source.file_name(), "a.txt");
    assert_eq!(k.status, IngestionStatus::Succeeded);
}

#[tokio::test]
async fn test_update_source_replaces_blob_and_reingests() {
    let h = harness().await;
    let old = b"first revision";
    let new = b"second revision with different words";
    let id = h.add_settled("alice", old, "doc.txt").await;

    h.manager
        .update_source(&id, new, "doc-v2.txt", "text/plain")
        .await
        .unwrap();
    h.dispatcher.drain().await;

    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(k.checksum, checksum_bytes(new));
    assert_eq!(k.source.file_name(), "doc-v2.txt");
    assert_eq!(k.status, IngestionStatus::Succeeded);
    assert!(!h.blob_path(&checksum_bytes(old)).exists());
    assert!(h.blob_path(&checksum_bytes(new)).exists());

    let (file_name, bytes, _) = h.manager.get_file(&id).await.unwrap();
    assert_eq!(file_name, "doc-v2.txt");
    assert_eq!(bytes, new);
}

#[tokio::test]
async fn test_update_source_keeps_shared_old_blob() {
    let h = harness().await;
    let shared = b"shared original";
    let id1 = h.add_settled("alice", shared, "a.txt").await;
    let _id2 = h.add_settled("bob", shared, "b.txt").await;

    h.manager
        .update_source(&id1, b"diverged", "a.txt", "text/plain")
        .await
        .unwrap();
    h.dispatcher.drain().await;

    assert!(h.blob_path(&checksum_bytes(shared)).exists());
}

#[tokio::test]
async fn test_set_permission_requires_succeeded_ingestion() {
    let h = harness().await;
    let id = h.add_settled("alice", b"content", "a.txt").await;

    for status in [IngestionStatus::Pending, IngestionStatus::Failed] {
        h.index.set_status(&id, status).await.unwrap();
        let err = h
            .manager
            .set_permission(&id, "bob", Permission::Readonly)
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::IllegalPermissionModification(_)));
        let err = h.manager.remove_permission(&id, "bob").await.unwrap_err();
        assert!(matches!(err, KbError::IllegalPermissionModification(_)));
    }
}

#[tokio::test]
async fn test_set_permission_rejects_none_and_owner() {
    let h = harness().await;
    let id = h.add_settled("alice", b"content", "a.txt").await;

    for p in [Permission::None, Permission::Owner] {
        let err = h.manager.set_permission(&id, "bob", p).await.unwrap_err();
        assert!(matches!(err, KbError::IllegalPermissionModification(_)));
    }
}

#[tokio::test]
async fn test_set_permission_cannot_touch_owner_grant() {
    let h = harness().await;
    let id = h.add_settled("alice", b"content", "a.txt").await;

    let err = h
        .manager
        .set_permission(&id, "alice", Permission::Readonly)
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::IllegalPermissionModification(_)));

    let err = h.manager.remove_permission(&id, "alice").await.unwrap_err();
    assert!(matches!(err, KbError::IllegalPermissionModification(_)));
}

#[tokio::test]
async fn test_set_permission_rejects_invalid_username() {
    let h = harness().await;
    let id = h.add_settled("alice", b"content", "a.txt").await;

    for bad in ["", "bo|b"] {
        let err = h
            .manager
            .set_permission(&id, bad, Permission::Readonly)
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::IllegalPermissionModification(_)));
    }
}

#[tokio::test]
async fn test_grant_projects_token_into_vector_store() {
    let h = harness().await;
    let id = h.add_settled("alice", b"kubernetes deployment checklist", "ops.txt").await;

    // Before the grant only alice's token matches.
    let hits = h.manager.search("kubernetes", "|bob|", 10).await.unwrap();
    assert!(hits.is_empty());

    h.manager
        .set_permission(&id, "bob", Permission::Readonly)
        .await
        .unwrap();
    let hits = h.manager.search("kubernetes", "|bob|", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].knowledge_id, id);

    h.manager.remove_permission(&id, "bob").await.unwrap();
    let hits = h.manager.search("kubernetes", "|bob|", 10).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_regrant_same_permission_is_noop() {
    let h = harness().await;
    let id = h.add_settled("alice", b"content", "a.txt").await;

    h.manager
        .set_permission(&id, "bob", Permission::Readonly)
        .await
        .unwrap();
    let before = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    h.manager
        .set_permission(&id, "bob", Permission::Readonly)
        .await
        .unwrap();
    let after = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(before.last_updated_at, after.last_updated_at);
}

#[tokio::test]
async fn test_remove_absent_permission_is_noop() {
    let h = harness().await;
    let id = h.add_settled("alice", b"content", "a.txt").await;
    h.manager.remove_permission(&id, "carol").await.unwrap();
}

#[tokio::test]
async fn test_any_grant_makes_entry_public() {
    let h = harness().await;
    let id = h.add_settled("alice", b"public onboarding guide", "guide.txt").await;

    h.manager
        .set_permission(&id, "ANY", Permission::Readonly)
        .await
        .unwrap();

    let hits = h.manager.search("onboarding", "|ANY|", 10).await.unwrap();
    assert_eq!(hits.len(), 1);

    let visible = h.manager.list_visible(None).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, id);
}

#[tokio::test]
async fn test_retry_reingests_failed_entry() {
    let h = harness().await;
    let id = h.add_settled("alice", b"retryable content", "a.txt").await;

    h.index.set_status(&id, IngestionStatus::Failed).await.unwrap();
    h.manager.retry_failed_ingestion(&id).await.unwrap();
    h.dispatcher.drain().await;

    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(k.status, IngestionStatus::Succeeded);
}

#[tokio::test]
async fn test_retry_is_noop_for_non_failed_entries() {
    let h = harness().await;
    let id = h.add_settled("alice", b"already fine", "a.txt").await;
    let before = h.manager.get_knowledge(&id).await.unwrap().unwrap();

    h.manager.retry_failed_ingestion(&id).await.unwrap();
    h.dispatcher.drain().await;

    let after = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(before.last_updated_at, after.last_updated_at);
}

/// Embedder whose advertised dimensionality disagrees with its output.
struct SkewedEmbedder;

impl Embedder for SkewedEmbedder {
    fn dims(&self) -> usize {
        8
    }

    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|_| vec![1.0, 0.0]).collect()
    }
}

#[tokio::test]
async fn test_dimension_mismatch_fails_ingestion() {
    let h = harness_with_embedder(Arc::new(SkewedEmbedder)).await;
    let id = h
        .manager
        .add_source_for_owner("alice", b"some text", "a.txt", "text/plain")
        .await
        .unwrap();
    h.dispatcher.drain().await;

    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(k.status, IngestionStatus::Failed);
    assert_eq!(h.vectors.count_by_knowledge_id(&id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_get_file_missing_blob_is_internal_fault() {
    let h = harness().await;
    let id = h.add_settled("alice", b"soon to vanish", "a.txt").await;
    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();

    std::fs::remove_file(h.blob_path(&k.checksum)).unwrap();
    let err = h.manager.get_file(&id).await.unwrap_err();
    assert!(matches!(err, KbError::Internal(_)));
}

#[tokio::test]
async fn test_tags_and_label() {
    let h = harness().await;
    let id = h.add_settled("alice", b"content", "a.txt").await;

    h.manager.add_tag(&id, "ops").await.unwrap();
    h.manager.add_tag(&id, "ops").await.unwrap();
    h.manager.add_tag(&id, "runbook").await.unwrap();
    h.manager.set_label(&id, Some("Ops runbook")).await.unwrap();

    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(k.tags.len(), 2);
    assert_eq!(k.display_name(), "Ops runbook");

    h.manager.remove_tag(&id, "ops").await.unwrap();
    h.manager.set_label(&id, None).await.unwrap();
    let k = h.manager.get_knowledge(&id).await.unwrap().unwrap();
    assert_eq!(k.tags.len(), 1);
    assert_eq!(k.display_name(), "a.txt");
}

#[tokio::test]
async fn test_operations_on_missing_id_fail() {
    let h = harness().await;
    let err = h.manager.get_file("missing").await.unwrap_err();
    assert!(matches!(err, KbError::KnowledgeNotFound));
    let err = h.manager.delete_knowledge("missing").await.unwrap_err();
    assert!(matches!(err, KbError::KnowledgeNotFound));
    let err = h
        .manager
        .update_source("missing", b"x", "x.txt", "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::KnowledgeNotFound));
}
