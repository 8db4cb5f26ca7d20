use sqlx::SqlitePool;

use crate::error::Result;

/// Create the knowledge index schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Knowledge entries. The checksum index is deliberately non-unique:
    // identical content uploaded by different users yields multiple rows
    // sharing one blob.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge (
            id TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
            status TEXT NOT NULL DEFAULT 'pending',
            token_count INTEGER,
            created_at INTEGER NOT NULL,
            last_updated_at INTEGER NOT NULL,
            label TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            source_kind TEXT NOT NULL DEFAULT 'file',
            file_name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-user capability grants. Only readonly and above are stored;
    // absence of a row means no access.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_permissions (
            knowledge_id TEXT NOT NULL,
            username TEXT NOT NULL,
            permission TEXT NOT NULL,
            UNIQUE(knowledge_id, username),
            FOREIGN KEY (knowledge_id) REFERENCES knowledge(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedding points for the bundled SQLite vector store backend.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            segment_id TEXT PRIMARY KEY,
            knowledge_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            content_type TEXT NOT NULL,
            permission_token TEXT NOT NULL,
            vector BLOB NOT NULL,
            snippet TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_knowledge_checksum ON knowledge(checksum)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_permissions_username ON knowledge_permissions(username)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embeddings_knowledge_id ON embeddings(knowledge_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
