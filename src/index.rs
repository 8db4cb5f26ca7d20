//! Knowledge Index — the relational record of knowledge entries.
//!
//! A thin repository over SQLite. Multi-statement mutations run inside a
//! short transaction owned by the repository method, keeping transaction
//! boundaries visible and bounded; blob and vector side effects never
//! happen inside these transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{KbError, Result};
use crate::models::{IngestionStatus, Knowledge, KnowledgeSource};
use crate::permission::Permission;

/// Repository for [`Knowledge`] rows and their permission grants.
#[derive(Clone)]
pub struct KnowledgeIndex {
    pool: SqlitePool,
}

impl KnowledgeIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new knowledge entry and its initial grants.
    pub async fn insert(&self, knowledge: &Knowledge) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO knowledge (id, checksum, content_type, status, token_count, created_at, last_updated_at, label, tags_json, source_kind, file_name)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&knowledge.id)
        .bind(&knowledge.checksum)
        .bind(&knowledge.content_type)
        .bind(knowledge.status.as_str())
        .bind(knowledge.token_count)
        .bind(knowledge.created_at)
        .bind(knowledge.last_updated_at)
        .bind(&knowledge.label)
        .bind(tags_to_json(&knowledge.tags))
        .bind(knowledge.source.kind())
        .bind(knowledge.source.file_name())
        .execute(&mut *tx)
        .await?;

        for (username, permission) in &knowledge.permissions {
            if *permission >= Permission::Readonly {
                sqlx::query(
                    "INSERT INTO knowledge_permissions (knowledge_id, username, permission) VALUES (?, ?, ?)",
                )
                .bind(&knowledge.id)
                .bind(username)
                .bind(permission.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Look up a knowledge entry by id.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Knowledge>> {
        let row = sqlx::query("SELECT * FROM knowledge WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let permissions = self.load_permissions(id).await?;
                Ok(Some(map_row(&row, permissions)?))
            }
            None => Ok(None),
        }
    }

    /// Number of knowledge entries referencing a checksum.
    pub async fn count_by_checksum(&self, checksum: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge WHERE checksum = ?")
            .bind(checksum)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// All knowledge entries, oldest first.
    pub async fn list_all(&self) -> Result<Vec<Knowledge>> {
        let rows = sqlx::query("SELECT * FROM knowledge ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(rows).await
    }

    /// Knowledge entries visible to a username (its own grants plus `ANY`
    /// grants), or public entries only when `username` is `None`.
    pub async fn list_for_username(&self, username: Option<&str>) -> Result<Vec<Knowledge>> {
        let rows = match username {
            Some(username) => {
                sqlx::query(
                    r#"
                    SELECT DISTINCT k.* FROM knowledge k
                    JOIN knowledge_permissions p ON p.knowledge_id = k.id
                    WHERE p.username IN (?, 'ANY')
                    ORDER BY k.created_at, k.id
                    "#,
                )
                .bind(username)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT DISTINCT k.* FROM knowledge k
                    JOIN knowledge_permissions p ON p.knowledge_id = k.id
                    WHERE p.username = 'ANY'
                    ORDER BY k.created_at, k.id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        self.hydrate(rows).await
    }

    /// Set the ingestion status. A no-op (not an error) if `id` does not
    /// exist, since ingestion callbacks race with deletion.
    pub async fn set_status(&self, id: &str, status: IngestionStatus) -> Result<()> {
        sqlx::query("UPDATE knowledge SET status = ?, last_updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the ingested token count. Same no-op semantics as
    /// [`set_status`](Self::set_status).
    pub async fn set_token_count(&self, id: &str, token_count: i64) -> Result<()> {
        sqlx::query("UPDATE knowledge SET token_count = ? WHERE id = ?")
            .bind(token_count)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the source of an entry: new checksum, file name, and content
    /// type; status reset to pending and token count cleared.
    pub async fn update_source(
        &self,
        id: &str,
        checksum: &str,
        file_name: &str,
        content_type: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE knowledge
            SET checksum = ?, file_name = ?, content_type = ?,
                status = 'pending', token_count = NULL, last_updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(checksum)
        .bind(file_name)
        .bind(content_type)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete an entry and its grants.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM knowledge_permissions WHERE knowledge_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_label(&self, id: &str, label: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE knowledge SET label = ?, last_updated_at = ? WHERE id = ?")
            .bind(label)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_tags(&self, id: &str, tags: &BTreeSet<String>) -> Result<()> {
        sqlx::query("UPDATE knowledge SET tags_json = ?, last_updated_at = ? WHERE id = ?")
            .bind(tags_to_json(tags))
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the full grant map of an entry.
    pub async fn set_permissions(
        &self,
        id: &str,
        permissions: &BTreeMap<String, Permission>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM knowledge_permissions WHERE knowledge_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for (username, permission) in permissions {
            if *permission >= Permission::Readonly {
                sqlx::query(
                    "INSERT INTO knowledge_permissions (knowledge_id, username, permission) VALUES (?, ?, ?)",
                )
                .bind(id)
                .bind(username)
                .bind(permission.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }
        sqlx::query("UPDATE knowledge SET last_updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_permissions(&self, id: &str) -> Result<BTreeMap<String, Permission>> {
        let rows =
            sqlx::query("SELECT username, permission FROM knowledge_permissions WHERE knowledge_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let mut permissions = BTreeMap::new();
        for row in rows {
            let username: String = row.get("username");
            let raw: String = row.get("permission");
            let permission = Permission::from_str(&raw)
                .map_err(|_| KbError::Internal(format!("corrupt permission value '{}'", raw)))?;
            permissions.insert(username, permission);
        }
        Ok(permissions)
    }

    async fn hydrate(&self, rows: Vec<SqliteRow>) -> Result<Vec<Knowledge>> {
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let permissions = self.load_permissions(&id).await?;
            entries.push(map_row(&row, permissions)?);
        }
        Ok(entries)
    }
}

fn tags_to_json(tags: &BTreeSet<String>) -> String {
    serde_json::to_string(&tags.iter().collect::<Vec<_>>()).unwrap_or_else(|_| "[]".to_string())
}

fn map_row(row: &SqliteRow, permissions: BTreeMap<String, Permission>) -> Result<Knowledge> {
    let raw_status: String = row.get("status");
    let status = IngestionStatus::parse(&raw_status)
        .ok_or_else(|| KbError::Internal(format!("corrupt status value '{}'", raw_status)))?;

    let tags_json: String = row.get("tags_json");
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let source_kind: String = row.get("source_kind");
    let source = match source_kind.as_str() {
        "file" => KnowledgeSource::File {
            file_name: row.get("file_name"),
        },
        other => {
            return Err(KbError::Internal(format!(
                "unknown knowledge source kind '{}'",
                other
            )))
        }
    };

    Ok(Knowledge {
        id: row.get("id"),
        checksum: row.get("checksum"),
        content_type: row.get("content_type"),
        status,
        token_count: row.get("token_count"),
        created_at: row.get("created_at"),
        last_updated_at: row.get("last_updated_at"),
        label: row.get("label"),
        tags,
        permissions,
        source,
    })
}
