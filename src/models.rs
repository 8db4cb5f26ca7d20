//! Core data models for the knowledge base.
//!
//! These types represent knowledge entries, their ingestion lifecycle, and
//! the identities that act on them.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::permission::Permission;

/// One indexed reference to an ingested source document.
///
/// The `checksum` is the content hash of the source bytes and the
/// correlation key shared with the blob store and the vector store's
/// metadata. Multiple `Knowledge` records may share a checksum (two users
/// uploading identical content); the blob store holds exactly one blob per
/// checksum regardless.
#[derive(Debug, Clone)]
pub struct Knowledge {
    /// Opaque unique id, generated at creation, immutable.
    pub id: String,
    /// SHA-256 content hash of the source bytes, hex encoded.
    pub checksum: String,
    /// MIME type of the source.
    pub content_type: String,
    /// Asynchronous ingestion state.
    pub status: IngestionStatus,
    /// Token count of the ingested text, set post-ingestion.
    pub token_count: Option<i64>,
    /// Creation timestamp (unix epoch seconds), system-managed.
    pub created_at: i64,
    /// Last mutation timestamp (unix epoch seconds), system-managed.
    pub last_updated_at: i64,
    /// Optional user-facing name; defaults to the file name.
    pub label: Option<String>,
    /// Free-form tags.
    pub tags: BTreeSet<String>,
    /// Per-user capability grants. Absence means NONE.
    pub permissions: BTreeMap<String, Permission>,
    /// Origin-specific payload.
    pub source: KnowledgeSource,
}

impl Knowledge {
    /// Returns the username currently holding `OWNER`, if any.
    ///
    /// At most one owner can exist; the grant is only assigned at creation.
    pub fn owner(&self) -> Option<&str> {
        self.permissions
            .iter()
            .find(|(_, p)| **p == Permission::Owner)
            .map(|(u, _)| u.as_str())
    }

    /// Returns the user-facing display name (label, else file name).
    pub fn display_name(&self) -> &str {
        match &self.label {
            Some(label) => label,
            None => self.source.file_name(),
        }
    }
}

/// Origin of a knowledge entry, as a closed set of variants.
///
/// Dispatched by `match`; new knowledge origins (web pages, chat
/// transcripts) get new variants here rather than new subtypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnowledgeSource {
    /// File-backed knowledge uploaded by a user.
    File {
        /// Original file name of the upload.
        file_name: String,
    },
}

impl KnowledgeSource {
    /// The kind discriminant stored in the index.
    pub fn kind(&self) -> &'static str {
        match self {
            KnowledgeSource::File { .. } => "file",
        }
    }

    /// The file name associated with this source.
    pub fn file_name(&self) -> &str {
        match self {
            KnowledgeSource::File { file_name } => file_name,
        }
    }
}

/// Ingestion-status state machine.
///
/// `Pending → Succeeded` and `Pending → Failed` are reported by the
/// ingestion callbacks; `Failed → Pending` via retry; `update_source`
/// forces any state back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Succeeded => "succeeded",
            IngestionStatus::Failed => "failed",
        }
    }

    /// Parse the TEXT column representation. Unknown values indicate
    /// index-level corruption, not a user error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IngestionStatus::Pending),
            "succeeded" => Some(IngestionStatus::Succeeded),
            "failed" => Some(IngestionStatus::Failed),
            _ => None,
        }
    }
}

/// The identity a request is made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// An authenticated user, by stable username.
    User(String),
    /// An unauthenticated caller; sees only public (`ANY`-granted) records.
    Anonymous,
}

impl Identity {
    pub fn username(&self) -> Option<&str> {
        match self {
            Identity::User(u) => Some(u),
            Identity::Anonymous => None,
        }
    }
}

/// Role of a registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sees and may mutate everything.
    Admin,
    /// Scoped to own and public records.
    Standard,
}

/// A registered user as resolved by the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub role: Role,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            IngestionStatus::Pending,
            IngestionStatus::Succeeded,
            IngestionStatus::Failed,
        ] {
            assert_eq!(IngestionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(IngestionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_display_name_prefers_label() {
        let mut k = Knowledge {
            id: "k1".to_string(),
            checksum: "abc".to_string(),
            content_type: "text/plain".to_string(),
            status: IngestionStatus::Pending,
            token_count: None,
            created_at: 0,
            last_updated_at: 0,
            label: None,
            tags: BTreeSet::new(),
            permissions: BTreeMap::new(),
            source: KnowledgeSource::File {
                file_name: "notes.md".to_string(),
            },
        };
        assert_eq!(k.display_name(), "notes.md");
        k.label = Some("Team notes".to_string());
        assert_eq!(k.display_name(), "Team notes");
    }
}
