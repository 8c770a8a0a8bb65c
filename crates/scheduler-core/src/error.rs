//! Typed errors the worker loop must branch on.
//!
//! Infrastructure failures (`Unavailable`) never change submission state; the loop applies
//! `error_backoff_ms` and retries the tick. Everything else is a programming-contract violation
//! the loop is not expected to recover from.

use thiserror::Error;

use crate::model::Stage;

/// Errors surfaced by a [`crate::repository::ClaimRepository`] implementation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The Store could not be reached or a query failed for reasons unrelated to the scheduling
    /// predicate (connection reset, syntax error surfaced at runtime, pool exhausted).
    ///
    /// Maps to [`crate::model::ErrorKind::FatalInfrastructure`]: the Runner backs off, submission
    /// state is untouched.
    #[error("claim repository unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// A caller asked for a submission that does not exist.
    #[error("submission {public_id} not found")]
    NotFound { public_id: String },

    /// A caller passed a `max_attempts` of zero, which can never admit a first attempt.
    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),

    /// An artifact was requested for a stage that does not appear in the producing submission's
    /// trace.
    #[error("no artifact for submission {public_id} at stage {stage}")]
    ArtifactMissing { public_id: String, stage: Stage },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
