//! Database error types

use custodia_types::EscrowError;
use thiserror::Error;

/// Database operation errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Version conflict on {escrow_id}: expected version {expected_version}")]
    Conflict {
        escrow_id: String,
        expected_version: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<DbError> for EscrowError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(escrow_id) => EscrowError::NotFound { escrow_id },
            DbError::Conflict {
                escrow_id,
                expected_version,
            } => EscrowError::ConcurrencyConflict {
                escrow_id,
                expected_version,
            },
            other => EscrowError::storage(other.to_string()),
        }
    }
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;
