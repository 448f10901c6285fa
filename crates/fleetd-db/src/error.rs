//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for fleetd_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => fleetd_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => fleetd_core::Error::Conflict(msg),
            other => fleetd_core::Error::Persistence(other.to_string()),
        }
    }
}
