//! Asynchronous ingestion dispatch.
//!
//! The [`IngestionDispatcher`] trait is the fire-and-forget seam between
//! the knowledge manager and the pipeline that parses, splits, and embeds
//! a document. The manager never blocks on ingestion; completion is
//! observed only through the later status callback into the index.
//!
//! [`LocalDispatcher`] is the bundled implementation: a tokio task per
//! document running segment → embed → vector upsert, then reporting
//! `Succeeded`/`Failed` (and the token count) through
//! [`KnowledgeIndex::set_status`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::error::{KbError, Result};
use crate::index::KnowledgeIndex;
use crate::models::IngestionStatus;
use crate::segment::{estimate_tokens, split_text};
use crate::vector::{EmbeddingMetadata, EmbeddingPoint, VectorStore};

const SNIPPET_CHARS: usize = 240;

/// A document handed to ingestion, already decoded to text.
#[derive(Debug, Clone)]
pub struct IngestDocument {
    pub knowledge_id: String,
    pub text: String,
}

/// Fire-and-forget ingestion entry point.
///
/// `dispatch` returns once the work is queued; it must not block the
/// caller on parsing or embedding.
#[async_trait]
pub trait IngestionDispatcher: Send + Sync {
    async fn dispatch(&self, document: IngestDocument, metadata: EmbeddingMetadata) -> Result<()>;
}

/// In-process dispatcher backed by spawned tokio tasks.
pub struct LocalDispatcher {
    index: KnowledgeIndex,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    max_tokens: usize,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl LocalDispatcher {
    pub fn new(
        index: KnowledgeIndex,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        max_tokens: usize,
    ) -> Self {
        Self {
            index,
            vectors,
            embedder,
            max_tokens,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Wait for all dispatched ingestions to finish.
    ///
    /// Used by the CLI before process exit and by tests to observe
    /// completion deterministically.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("ingestion task panicked: {}", e);
            }
        }
    }
}

#[async_trait]
impl IngestionDispatcher for LocalDispatcher {
    async fn dispatch(&self, document: IngestDocument, metadata: EmbeddingMetadata) -> Result<()> {
        let index = self.index.clone();
        let vectors = Arc::clone(&self.vectors);
        let embedder = Arc::clone(&self.embedder);
        let max_tokens = self.max_tokens;

        let handle = tokio::spawn(async move {
            let knowledge_id = document.knowledge_id.clone();
            let status = match run_pipeline(&index, vectors, embedder, max_tokens, document, metadata)
                .await
            {
                Ok(()) => IngestionStatus::Succeeded,
                Err(e) => {
                    warn!(knowledge_id = %knowledge_id, "ingestion failed: {}", e);
                    IngestionStatus::Failed
                }
            };
            if let Err(e) = index.set_status(&knowledge_id, status).await {
                warn!(knowledge_id = %knowledge_id, "failed to record ingestion status: {}", e);
            }
        });

        self.tasks.lock().await.push(handle);
        Ok(())
    }
}

async fn run_pipeline(
    index: &KnowledgeIndex,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    max_tokens: usize,
    document: IngestDocument,
    metadata: EmbeddingMetadata,
) -> Result<()> {
    let segments = split_text(&document.knowledge_id, &document.text, max_tokens);
    let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
    let embeddings = embedder.embed(&texts);

    // A provider returning the wrong dimensionality would poison the
    // vector index; fail the ingestion instead.
    let dims = embedder.dims();
    if let Some(bad) = embeddings.iter().find(|v| v.len() != dims) {
        return Err(KbError::Internal(format!(
            "embedder returned a {}-dimensional vector, expected {}",
            bad.len(),
            dims
        )));
    }

    let points: Vec<EmbeddingPoint> = segments
        .iter()
        .zip(embeddings)
        .map(|(segment, vector)| EmbeddingPoint {
            segment_id: segment.id.clone(),
            vector,
            snippet: segment.snippet(SNIPPET_CHARS),
            metadata: metadata.clone(),
        })
        .collect();

    debug!(
        knowledge_id = %document.knowledge_id,
        segments = points.len(),
        "writing embedding points"
    );
    vectors.upsert(points).await?;
    index
        .set_token_count(&document.knowledge_id, estimate_tokens(&document.text))
        .await?;
    Ok(())
}
