//! Value types for the claim scheduler: public ids, stages, statuses, claims, artifacts.
//!
//! Everything here owns by `submission_id` (or is a free-standing value); there are no
//! back-references and nothing here performs IO.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The four processing stages, in pipeline order.
///
/// The core never dispatches on stage via trait objects or inheritance — every stage-aware
/// operation goes through [`Stage::descriptor`], a compile-time table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    TelegramIngest,
    Normalize,
    Evaluate,
    Deliver,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::TelegramIngest,
        Stage::Normalize,
        Stage::Evaluate,
        Stage::Deliver,
    ];

    /// The stage-agnostic attempt counter column name, fixed at compile time.
    ///
    /// Repository implementations match on this instead of interpolating column names into SQL.
    pub fn attempt_column(self) -> &'static str {
        match self {
            Stage::TelegramIngest => "attempt_telegram_ingest",
            Stage::Normalize => "attempt_normalization",
            Stage::Evaluate => "attempt_evaluation",
            Stage::Deliver => "attempt_delivery",
        }
    }

    /// The `(pre, in_progress, success, failure)` status tuple for this stage (§4.2).
    pub fn descriptor(self) -> StageDescriptor {
        match self {
            Stage::TelegramIngest => StageDescriptor {
                stage: self,
                pre: Status::TelegramUpdateReceived,
                in_progress: Status::TelegramIngestInProgress,
                success: Status::Uploaded,
                failure: Status::FailedTelegramIngest,
            },
            Stage::Normalize => StageDescriptor {
                stage: self,
                pre: Status::Uploaded,
                in_progress: Status::NormalizationInProgress,
                success: Status::Normalized,
                failure: Status::FailedNormalization,
            },
            Stage::Evaluate => StageDescriptor {
                stage: self,
                pre: Status::Normalized,
                in_progress: Status::EvaluationInProgress,
                success: Status::Evaluated,
                failure: Status::FailedEvaluation,
            },
            Stage::Deliver => StageDescriptor {
                stage: self,
                pre: Status::Evaluated,
                in_progress: Status::DeliveryInProgress,
                success: Status::Delivered,
                failure: Status::FailedDelivery,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::TelegramIngest => "telegram_ingest",
            Stage::Normalize => "normalize",
            Stage::Evaluate => "evaluate",
            Stage::Deliver => "deliver",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(S_pre, S_ip, S_ok, S_fail)` tuple parameterizing the one generic worker loop for a
/// stage. See design note "No dynamic dispatch over stages at the core" (§9).
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    pub stage: Stage,
    pub pre: Status,
    pub in_progress: Status,
    pub success: Status,
    pub failure: Status,
}

/// The 14 submission states of §4.2. A submission's status is its sole scheduling-relevant
/// mutable field besides the lease and attempt counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    TelegramUpdateReceived,
    TelegramIngestInProgress,
    Uploaded,
    NormalizationInProgress,
    Normalized,
    EvaluationInProgress,
    Evaluated,
    DeliveryInProgress,
    Delivered,
    FailedTelegramIngest,
    FailedNormalization,
    FailedEvaluation,
    FailedDelivery,
    DeadLetter,
}

impl Status {
    /// `true` for the two terminal states: a submission in one of these is never claimed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Delivered | Status::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::TelegramUpdateReceived => "telegram_update_received",
            Status::TelegramIngestInProgress => "telegram_ingest_in_progress",
            Status::Uploaded => "uploaded",
            Status::NormalizationInProgress => "normalization_in_progress",
            Status::Normalized => "normalized",
            Status::EvaluationInProgress => "evaluation_in_progress",
            Status::Evaluated => "evaluated",
            Status::DeliveryInProgress => "delivery_in_progress",
            Status::Delivered => "delivered",
            Status::FailedTelegramIngest => "failed_telegram_ingest",
            Status::FailedNormalization => "failed_normalization",
            Status::FailedEvaluation => "failed_evaluation",
            Status::FailedDelivery => "failed_delivery",
            Status::DeadLetter => "dead_letter",
        }
    }

    /// Parse the CHECK-constraint string form back into a `Status`.
    pub fn parse(s: &str) -> Option<Status> {
        Some(match s {
            "telegram_update_received" => Status::TelegramUpdateReceived,
            "telegram_ingest_in_progress" => Status::TelegramIngestInProgress,
            "uploaded" => Status::Uploaded,
            "normalization_in_progress" => Status::NormalizationInProgress,
            "normalized" => Status::Normalized,
            "evaluation_in_progress" => Status::EvaluationInProgress,
            "evaluated" => Status::Evaluated,
            "delivery_in_progress" => Status::DeliveryInProgress,
            "delivered" => Status::Delivered,
            "failed_telegram_ingest" => Status::FailedTelegramIngest,
            "failed_normalization" => Status::FailedNormalization,
            "failed_evaluation" => Status::FailedEvaluation,
            "failed_delivery" => Status::FailedDelivery,
            "dead_letter" => Status::DeadLetter,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque, externally-visible identifier: a fixed prefix plus a Crockford-ULID suffix.
///
/// Matches the persisted-state regex `^(sub|cand|asg)_[0-9A-HJKMNP-TV-Z]{26}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicId(String);

impl PublicId {
    /// Mint a fresh id with the given prefix (`"sub"`, `"cand"`, or `"asg"`).
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", Ulid::new()))
    }

    /// Wrap an already-formatted id (e.g. read back from the Store) without revalidating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A successful `claim_next` result: everything a worker needs to run a stage handler.
#[derive(Debug, Clone)]
pub struct Claim {
    pub public_id: PublicId,
    pub stage: Stage,
    /// The attempt counter's value *before* this attempt (0 on first claim).
    pub attempt: i32,
    pub worker_id: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// A reference to a stage's persisted output, as linked by `link_artifact`.
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    pub bucket: String,
    pub object_key: String,
    pub schema_version: i32,
}

/// A fully-hydrated artifact row, append-only, keyed by `(submission_id, stage)` with
/// latest-wins read semantics on `(created_at, id)`.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: i64,
    pub submission_id: PublicId,
    pub stage: Stage,
    pub bucket: String,
    pub object_key: String,
    pub schema_version: i32,
    pub created_at: DateTime<Utc>,
}

/// Classification of a stage handler's failure, driving retry vs. terminal policy (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout, upstream 5xx, LLM rate limit.
    RetryableTransient,
    /// Lease lost, reclaim race. No attempt increment from this worker — the reclaim already did.
    RetryableResource,
    /// Artifact schema mismatch under `strict`, malformed normalized payload.
    PermanentBadInput,
    /// A negative business result that is itself the successful outcome, not a failure.
    PermanentBusiness,
    /// Handler cancelled by lease loss or shutdown; treated as `RetryableResource`.
    Cancelled,
    /// Repository unreachable; no submission state change, tick errors out.
    FatalInfrastructure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RetryableTransient => "retryable_transient",
            ErrorKind::RetryableResource => "retryable_resource",
            ErrorKind::PermanentBadInput => "permanent_bad_input",
            ErrorKind::PermanentBusiness => "permanent_business",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::FatalInfrastructure => "fatal_infrastructure",
        }
    }

    /// Whether a failure of this kind should be retried (subject to attempt budget) rather than
    /// dead-lettered on the first occurrence.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RetryableTransient | ErrorKind::RetryableResource | ErrorKind::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
