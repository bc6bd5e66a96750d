use matchbook_core::MatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    Invalid(String),
    #[error("Invalid row: {0}")]
    InvalidRow(String),
    #[error("Invalid alias seed file: {0}")]
    Seed(#[from] toml::de::Error),
}

impl From<MatchError> for StoreError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::NotFound(what) => StoreError::NotFound(what),
            MatchError::Conflict(msg) => StoreError::Conflict(msg),
            MatchError::Validation(msg) => StoreError::Invalid(msg),
        }
    }
}

/// Turns a unique-index violation into a `Conflict` carrying `context`;
/// anything else stays a database error.
pub(crate) fn conflict_on_unique(err: sqlx::Error, context: &str) -> StoreError {
    match err {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(context.to_string())
        }
        other => StoreError::Database(other),
    }
}

pub(crate) fn invalid_row(table: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidRow(format!("{table}: {detail}"))
}
