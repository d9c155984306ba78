//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<DbError> for cyclone_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => cyclone_core::Error::NotFound(what),
            DbError::Duplicate(what) => cyclone_core::Error::Conflict(what),
            other => cyclone_core::Error::Internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
