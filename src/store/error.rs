//! Error types for the durable store.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Filesystem error (directory creation, backups).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection guard was not acquired within the bounded wait.
    #[error("store guard not acquired within {0} ms")]
    LockTimeout(u64),
    /// The store has been closed.
    #[error("store is closed")]
    Closed,
    /// No conversation with this name.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    /// Another conversation already has this name.
    #[error("conversation already exists: {0}")]
    ConversationExists(String),
    /// A stored value could not be decoded.
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

impl StoreError {
    /// Whether the error is a transient `SQLITE_BUSY` / `SQLITE_LOCKED` condition.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the error is a uniqueness / constraint violation.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
        )
    }
}

/// Convenience result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
