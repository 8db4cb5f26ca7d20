//! kbase error types.

use thiserror::Error;

use crate::storage::StorageError;

/// kbase error type.
#[derive(Error, Debug)]
pub enum KbError {
    /// An uploaded source document was empty.
    #[error("uploaded file is empty")]
    EmptyFile,

    /// The knowledge id does not exist, or the caller may not see it.
    #[error("knowledge not found")]
    KnowledgeNotFound,

    /// A permission change violated the grant rules.
    #[error("illegal permission modification: {0}")]
    IllegalPermissionModification(String),

    /// The caller can see the entry but lacks the required capability.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The caller is not a registered user.
    #[error("caller is not a registered user")]
    NotRegistered,

    /// A username argument did not resolve to a registered user.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Blob store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Index database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation or corrupt stored state.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for kbase operations.
pub type Result<T> = std::result::Result<T, KbError>;
