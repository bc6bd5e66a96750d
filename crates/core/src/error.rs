use thiserror::Error;

/// Failures of a single matching operation. None of these are fatal to the
/// process; batch callers count them per item.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    /// The id does not exist or belongs to another user.
    #[error("{0} not found")]
    NotFound(String),
    /// A state-transition guard was violated: the match is not in the expected
    /// source state, or the receipt/target is already claimed.
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid input: {0}")]
    Validation(String),
}
