//! Vector store capability interface.
//!
//! The [`VectorStore`] trait covers exactly what the knowledge manager
//! needs from a vector index: upserting embedding points with metadata,
//! removing and re-tagging points by knowledge id, and similarity search
//! scoped by a permission token.
//!
//! The store's metadata filter only matches on a single string field, so
//! the permission token is the delimiter-wrapped projection built by
//! [`crate::permission::permissions_to_token`]; a point matches a query
//! when its stored token contains the query token as a substring.
//!
//! Two implementations ship with the crate: [`InMemoryVectorStore`]
//! (tests, ephemeral setups) and [`SqliteVectorStore`] (persistent,
//! shares the index database).

use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::error::{KbError, Result};

/// Cross-store metadata attached to every embedding point.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMetadata {
    pub knowledge_id: String,
    pub checksum: String,
    pub content_type: String,
    pub permission_token: String,
}

/// One embedded text segment plus its metadata.
#[derive(Debug, Clone)]
pub struct EmbeddingPoint {
    /// Segment id, unique within the store.
    pub segment_id: String,
    pub vector: Vec<f32>,
    /// Text excerpt kept for result display.
    pub snippet: String,
    pub metadata: EmbeddingMetadata,
}

/// A search hit returned from [`VectorStore::search`].
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub segment_id: String,
    pub knowledge_id: String,
    pub score: f64,
    pub snippet: String,
}

/// Abstract vector index backend.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace embedding points by segment id.
    async fn upsert(&self, points: Vec<EmbeddingPoint>) -> Result<()>;

    /// Remove every point belonging to a knowledge entry.
    async fn remove_by_knowledge_id(&self, knowledge_id: &str) -> Result<()>;

    /// Replace the permission token on every point of a knowledge entry.
    async fn update_permission_token(&self, knowledge_id: &str, token: &str) -> Result<()>;

    /// Cosine similarity search over points whose permission token
    /// contains `permission_token`.
    async fn search(
        &self,
        query: &[f32],
        permission_token: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>>;

    /// Number of points stored for a knowledge entry.
    async fn count_by_knowledge_id(&self, knowledge_id: &str) -> Result<usize>;
}

pub(crate) fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

// ============ In-memory implementation ============

/// In-memory vector store for tests and ephemeral setups.
///
/// Brute-force cosine similarity over all stored points behind a
/// `std::sync::RwLock`.
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: RwLock<Vec<EmbeddingPoint>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, new_points: Vec<EmbeddingPoint>) -> Result<()> {
        let mut points = self.points.write().unwrap();
        for p in new_points {
            points.retain(|existing| existing.segment_id != p.segment_id);
            points.push(p);
        }
        Ok(())
    }

    async fn remove_by_knowledge_id(&self, knowledge_id: &str) -> Result<()> {
        let mut points = self.points.write().unwrap();
        points.retain(|p| p.metadata.knowledge_id != knowledge_id);
        Ok(())
    }

    async fn update_permission_token(&self, knowledge_id: &str, token: &str) -> Result<()> {
        let mut points = self.points.write().unwrap();
        for p in points.iter_mut() {
            if p.metadata.knowledge_id == knowledge_id {
                p.metadata.permission_token = token.to_string();
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        permission_token: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let points = self.points.read().unwrap();
        let mut hits: Vec<VectorHit> = points
            .iter()
            .filter(|p| p.metadata.permission_token.contains(permission_token))
            .map(|p| VectorHit {
                segment_id: p.segment_id.clone(),
                knowledge_id: p.metadata.knowledge_id.clone(),
                score: cosine_sim(query, &p.vector) as f64,
                snippet: p.snippet.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count_by_knowledge_id(&self, knowledge_id: &str) -> Result<usize> {
        let points = self.points.read().unwrap();
        Ok(points
            .iter()
            .filter(|p| p.metadata.knowledge_id == knowledge_id)
            .count())
    }
}

// ============ SQLite implementation ============

/// SQLite-backed vector store sharing the knowledge index database.
///
/// Vectors are stored as little-endian `f32` BLOBs; search is brute-force
/// cosine over the candidate rows whose token matches the filter.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Encode a vector as little-endian bytes for BLOB storage.
fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode a BLOB back into a vector.
fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, points: Vec<EmbeddingPoint>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for p in &points {
            sqlx::query(
                r#"
                INSERT INTO embeddings (segment_id, knowledge_id, checksum, content_type, permission_token, vector, snippet)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(segment_id) DO UPDATE SET
                    knowledge_id = excluded.knowledge_id,
                    checksum = excluded.checksum,
                    content_type = excluded.content_type,
                    permission_token = excluded.permission_token,
                    vector = excluded.vector,
                    snippet = excluded.snippet
                "#,
            )
            .bind(&p.segment_id)
            .bind(&p.metadata.knowledge_id)
            .bind(&p.metadata.checksum)
            .bind(&p.metadata.content_type)
            .bind(&p.metadata.permission_token)
            .bind(vec_to_blob(&p.vector))
            .bind(&p.snippet)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_by_knowledge_id(&self, knowledge_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM embeddings WHERE knowledge_id = ?")
            .bind(knowledge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_permission_token(&self, knowledge_id: &str, token: &str) -> Result<()> {
        sqlx::query("UPDATE embeddings SET permission_token = ? WHERE knowledge_id = ?")
            .bind(token)
            .bind(knowledge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        permission_token: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        // instr() gives substring containment of the query token within
        // the stored token, the only filter primitive this scheme needs.
        let rows = sqlx::query(
            "SELECT segment_id, knowledge_id, vector, snippet FROM embeddings WHERE instr(permission_token, ?) > 0",
        )
        .bind(permission_token)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                VectorHit {
                    segment_id: row.get("segment_id"),
                    knowledge_id: row.get("knowledge_id"),
                    score: cosine_sim(query, &blob_to_vec(&blob)) as f64,
                    snippet: row.get("snippet"),
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count_by_knowledge_id(&self, knowledge_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE knowledge_id = ?")
            .bind(knowledge_id)
            .fetch_one(&self.pool)
            .await?;
        usize::try_from(count).map_err(|e| KbError::Internal(e.to_string()))
    }
}
