use matchbook_core::MatchError;
use matchbook_engine::ConfigError;
use matchbook_storage::StoreError;
use thiserror::Error;

/// What a `MatchService` call can fail with. `Conflict` means the caller
/// should refetch and retry; none of these are fatal to the process.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(StoreError),
}

impl From<MatchError> for ServiceError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::NotFound(what) => ServiceError::NotFound(what),
            MatchError::Conflict(msg) => ServiceError::Conflict(msg),
            MatchError::Validation(msg) => ServiceError::Validation(msg),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::Invalid(msg) => ServiceError::Validation(msg),
            StoreError::Seed(e) => ServiceError::Validation(format!("alias seed file: {e}")),
            other => ServiceError::Storage(other),
        }
    }
}

impl From<ConfigError> for ServiceError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Invalid(e) => e.into(),
            ConfigError::Parse(e) => ServiceError::Validation(format!("matching config: {e}")),
        }
    }
}
