//! Error types for huntstore.

use std::time::Duration;

use thiserror::Error;

use crate::schema::{FieldError, ValidationErrors};

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("invalid schema: {0}")]
    Schema(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document is not deleted: {0}")]
    NotDeleted(String),

    #[error("document id already exists: {0}")]
    DuplicateId(String),

    #[error("collection {0} is soft-deletable; physical removal is not allowed")]
    SoftDeleteOnly(String),

    #[error("timed out after {waited:?} waiting for lock {name}")]
    LockTimeout { name: String, waited: Duration },

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("migration marker moved unexpectedly: expected {expected}, found {found}")]
    MarkerConflict { expected: u32, found: u32 },

    #[error("gave up after repeated concurrent modification: {0}")]
    Contention(String),

    #[error("external service error during {operation}: {message}")]
    External {
        operation: &'static str,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database bootstrap failed: {0}")]
    MigrateDatabase(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ValidationErrors> for Error {
    fn from(errors: ValidationErrors) -> Self {
        Error::Validation(errors)
    }
}

impl From<FieldError> for Error {
    fn from(error: FieldError) -> Self {
        Error::Validation(error.into())
    }
}

impl Error {
    /// Transient failures that are safe to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::Contention(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
