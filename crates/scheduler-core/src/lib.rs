//! # scheduler-core
//!
//! The durable work-claim scheduler and staged state machine that coordinates the submission
//! pipeline: many stateless workers concurrently poll a shared relational store, claim one
//! submission at a time under a time-bounded lease, process it, heartbeat, and finalize with
//! success, retryable failure, or terminal dead-letter.
//!
//! ## Architecture
//!
//! ```text
//! Runner.run()
//!     │  sleeps poll/idle/error, loops WorkerLoop.run_once()
//!     ▼
//! WorkerLoop.run_once()
//!     │
//!     ├─► reclaim_expired_retry / reclaim_expired_dead_letter   (lease-expired claims)
//!     │
//!     ├─► claim_next ─► None ───────────────────────────────► did_work = false
//!     │        │
//!     │     Some(claim)
//!     │        │
//!     │        ├─► spawn heartbeat task ──► heartbeat_claim every heartbeat_interval_ms
//!     │        │                               │
//!     │        │                          false ⇒ cancel handler
//!     │        ▼
//!     │   StageHandler.process(claim, deps, cancel) ─► ProcessResult
//!     │        │
//!     │        ├─ success + artifact_ref ─► link_artifact
//!     │        │
//!     │        └─► finalize_success | finalize_failure_retry | finalize_failure_terminal
//!     ▼
//! ```
//!
//! ## Key invariants
//!
//! 1. At-most-one active owner per submission per stage (enforced by `FOR UPDATE SKIP LOCKED`
//!    plus lease-gated conditional updates — see [`repository::ClaimRepository`]).
//! 2. Bounded retry under per-stage attempt counters.
//! 3. Crash-orphaned claims are reclaimed once their lease expires.
//! 4. Status transitions are gated by both status and lease ownership, never by status alone.
//! 5. Stage handlers are idempotent; artifact linkage happens between process and finalize.
//!
//! ## What this crate is not
//!
//! This is not a general event-sourcing or saga engine, and it does not implement dead-letter
//! triage, priority scheduling, or cross-stage transactions — those are explicit non-goals of the
//! submission pipeline this crate schedules.

pub mod config;
pub mod error;
pub mod handler;
pub mod model;
pub mod repository;
pub mod runner;
pub mod worker_loop;

pub use config::{ArtifactCompatPolicy, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use handler::{HandlerDeps, ProcessResult, StageHandler};
pub use model::{Artifact, ArtifactRef, Claim, ErrorKind, PublicId, Stage, StageDescriptor, Status};
pub use repository::{ClaimRepository, SubmissionSnapshot};
pub use runner::{Runner, RunnerMetrics, RunnerMetricsSnapshot, RunnerTimings};
pub use worker_loop::{TickOutcome, WorkerLoop, WorkerLoopConfig};

// Re-export commonly used external types, matching this crate's existing convention of
// re-exporting the async-trait macro alongside its own traits.
pub use async_trait::async_trait;

#[cfg(test)]
mod tests {
    use super::*;
    use model::{Stage, Status};

    #[test]
    fn stage_descriptor_matches_state_table() {
        let d = Stage::TelegramIngest.descriptor();
        assert_eq!(d.pre, Status::TelegramUpdateReceived);
        assert_eq!(d.in_progress, Status::TelegramIngestInProgress);
        assert_eq!(d.success, Status::Uploaded);
        assert_eq!(d.failure, Status::FailedTelegramIngest);

        let d = Stage::Normalize.descriptor();
        assert_eq!(d.pre, Status::Uploaded);
        assert_eq!(d.in_progress, Status::NormalizationInProgress);
        assert_eq!(d.success, Status::Normalized);
        assert_eq!(d.failure, Status::FailedNormalization);

        let d = Stage::Evaluate.descriptor();
        assert_eq!(d.pre, Status::Normalized);
        assert_eq!(d.in_progress, Status::EvaluationInProgress);
        assert_eq!(d.success, Status::Evaluated);
        assert_eq!(d.failure, Status::FailedEvaluation);

        let d = Stage::Deliver.descriptor();
        assert_eq!(d.pre, Status::Evaluated);
        assert_eq!(d.in_progress, Status::DeliveryInProgress);
        assert_eq!(d.success, Status::Delivered);
        assert_eq!(d.failure, Status::FailedDelivery);
    }

    #[test]
    fn only_delivered_and_dead_letter_are_terminal() {
        for status in [
            Status::TelegramUpdateReceived,
            Status::TelegramIngestInProgress,
            Status::Uploaded,
            Status::NormalizationInProgress,
            Status::Normalized,
            Status::EvaluationInProgress,
            Status::Evaluated,
            Status::DeliveryInProgress,
            Status::FailedTelegramIngest,
            Status::FailedNormalization,
            Status::FailedEvaluation,
            Status::FailedDelivery,
        ] {
            assert!(!status.is_terminal(), "{status} should not be terminal");
        }
        assert!(Status::Delivered.is_terminal());
        assert!(Status::DeadLetter.is_terminal());
    }

    #[test]
    fn status_string_round_trips() {
        for status in [
            Status::TelegramUpdateReceived,
            Status::TelegramIngestInProgress,
            Status::Uploaded,
            Status::NormalizationInProgress,
            Status::Normalized,
            Status::EvaluationInProgress,
            Status::Evaluated,
            Status::DeliveryInProgress,
            Status::Delivered,
            Status::FailedTelegramIngest,
            Status::FailedNormalization,
            Status::FailedEvaluation,
            Status::FailedDelivery,
            Status::DeadLetter,
        ] {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
        assert_eq!(Status::parse("not_a_status"), None);
    }

    #[test]
    fn public_id_carries_prefix() {
        let id = model::PublicId::generate("sub");
        assert!(id.as_str().starts_with("sub_"));
        assert_eq!(id.as_str().len(), "sub_".len() + 26);
    }

    #[test]
    fn error_kind_retry_classification() {
        assert!(ErrorKind::RetryableTransient.is_retryable());
        assert!(ErrorKind::RetryableResource.is_retryable());
        assert!(ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::PermanentBadInput.is_retryable());
        assert!(!ErrorKind::PermanentBusiness.is_retryable());
        assert!(!ErrorKind::FatalInfrastructure.is_retryable());
    }
}
