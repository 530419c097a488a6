// Typed failure taxonomy for auction operations.
//
// Every operation reports failures synchronously with a stable
// machine-readable kind and a human-readable message. Internal faults
// (store errors, corrupted rows) are wrapped opaquely: they are logged
// with full context server-side and never expose detail to callers.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failure kinds an auction operation can report.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The referenced auction, team, or player does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The operation is not valid for the auction's current status
    /// (e.g. bidding on a non-ongoing auction, ending twice).
    #[error("{0}")]
    InvalidState(String),

    /// Malformed input (non-positive amount, bad increment override).
    #[error("{0}")]
    InvalidArgument(String),

    /// The proposed amount is below the current bid plus the increment.
    #[error("bid too low: minimum acceptable bid is {minimum}")]
    BidTooLow { minimum: i64 },

    /// The authorization collaborator denied the acting identity.
    #[error("{0}")]
    Forbidden(String),

    /// The affordability check failed: the extra commitment the bid
    /// requires exceeds what is left of the team's budget cap.
    #[error("insufficient budget: bid requires {required} more, {available} available")]
    InsufficientBudget { required: i64, available: i64 },

    /// An optimistic precondition was violated at commit time.
    #[error("{0}")]
    Conflict(String),

    /// Unexpected fault. Logged server-side; callers only see the kind.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ServiceError::NotFound { what: what.into() }
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        ServiceError::Internal(err.into())
    }

    /// Stable machine-readable code for wire frames and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::InvalidState(_) => "invalid_state",
            ServiceError::InvalidArgument(_) => "invalid_argument",
            ServiceError::BidTooLow { .. } => "bid_too_low",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::InsufficientBudget { .. } => "insufficient_budget",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Internal(_) => "internal",
        }
    }

    /// Message safe to send to callers. For `Internal` this is a generic
    /// string; the underlying source stays in the server log.
    pub fn public_message(&self) -> String {
        self.to_string()
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        ServiceError::Internal(anyhow::Error::new(err))
    }
}
