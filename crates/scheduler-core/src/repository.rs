//! The [`ClaimRepository`] trait: the sole gateway to the Store for scheduling operations.
//!
//! Every method here is a single conditional statement against the Store. The precondition in
//! each method's WHERE clause *is* the safety argument — callers never pre-check and then act;
//! they call the conditional operation and branch on its boolean/row-set result.
//!
//! # Implementer notes
//!
//! - Use `FOR UPDATE SKIP LOCKED` (PostgreSQL) or equivalent for [`ClaimRepository::claim_next`].
//! - Select the per-stage attempt column at compile time via [`crate::model::Stage::attempt_column`]
//!   — never interpolate a column name built from caller input into SQL text.
//! - All methods must be safe to call again with the same arguments after a crash; none of them
//!   may leave the Store in a state outside the graph in `model::Status`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Artifact, ArtifactRef, Claim, PublicId, Stage, Status};

/// The sole gateway to the Store for scheduling operations (§4.1).
#[async_trait]
pub trait ClaimRepository: Send + Sync {
    /// Atomically claim the oldest submission in `expected_status`, moving it to
    /// `in_progress_status` under a fresh lease. Returns `None` if no row is ready — this is the
    /// common case under low load and must not be treated as an error.
    async fn claim_next(
        &self,
        expected_status: Status,
        in_progress_status: Status,
        worker_id: &str,
        lease_seconds: i64,
        stage: Stage,
    ) -> Result<Option<Claim>>;

    /// Extend the lease on a claim still owned by `worker_id`. Returns `false` if the lease was
    /// lost (reclaimed, finalized, or transitioned away by another actor) — the caller must treat
    /// that as a cancellation signal, not retry the heartbeat.
    async fn heartbeat_claim(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool>;

    /// Move a claim to its stage's success status and clear lease/error fields. Returns `false`
    /// if the lease was lost; the caller must not retry from this worker.
    async fn finalize_success(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        success_status: Status,
    ) -> Result<bool>;

    /// Increment the stage's attempt counter and move to `failed_status`, gated by
    /// `attempt + 1 < max_attempts`. Returns `false` either because the lease was lost or because
    /// attempts are exhausted — the caller must call [`ClaimRepository::finalize_failure_terminal`]
    /// in the latter case (§4.3 step 6).
    #[allow(clippy::too_many_arguments)]
    async fn finalize_failure_retry(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        failed_status: Status,
        error_code: &str,
        error_message: &str,
        max_attempts: i32,
        stage: Stage,
    ) -> Result<bool>;

    /// Move a claim straight to `dead_letter`, without incrementing the attempt counter (the
    /// attempt that triggered exhaustion is already accounted for). Uses row-level locking to
    /// serialize with a concurrent reclaim.
    async fn finalize_failure_terminal(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool>;

    /// Return every expired claim for `stage` with attempts remaining to its failed status,
    /// incrementing the attempt counter. Bounded by `batch_limit` rows per call (§6's
    /// `WORKER_RECLAIM_BATCH_LIMIT`); safe to call again to pick up whatever it left behind.
    #[allow(clippy::too_many_arguments)]
    async fn reclaim_expired_retry(
        &self,
        in_progress_status: Status,
        failed_status: Status,
        error_code: &str,
        error_message: &str,
        max_attempts: i32,
        stage: Stage,
        batch_limit: i64,
    ) -> Result<Vec<PublicId>>;

    /// Return every expired claim for `stage` with attempts exhausted straight to `dead_letter`,
    /// bounded by `batch_limit` rows per call.
    /// Together with [`ClaimRepository::reclaim_expired_retry`], partitions the expired-claims
    /// set — every expired row is moved by exactly one of the two.
    #[allow(clippy::too_many_arguments)]
    async fn reclaim_expired_dead_letter(
        &self,
        in_progress_status: Status,
        error_code: &str,
        error_message: &str,
        max_attempts: i32,
        stage: Stage,
        batch_limit: i64,
    ) -> Result<Vec<PublicId>>;

    /// Unconditional stage-agnostic status edge, used by ingress (e.g.
    /// `telegram_update_received → uploaded`).
    async fn transition_state(
        &self,
        public_id: &PublicId,
        from_status: Status,
        to_status: Status,
    ) -> Result<bool>;

    /// Append-only insert of a stage's output location.
    async fn link_artifact(
        &self,
        public_id: &PublicId,
        stage: Stage,
        bucket: &str,
        object_key: &str,
        schema_version: i32,
    ) -> Result<()>;

    /// Read the latest artifact for `stage` on `public_id` (greatest `(created_at, id)`), or
    /// `None` if that stage hasn't produced output yet.
    async fn get_artifact_ref(
        &self,
        public_id: &PublicId,
        stage: Stage,
    ) -> Result<Option<ArtifactRef>>;

    /// Full artifact trace for a submission, oldest first, for read endpoints like
    /// `GET /submissions/{id}`.
    async fn list_artifacts(&self, public_id: &PublicId) -> Result<Vec<Artifact>>;

    /// Current status and lease snapshot, for read endpoints and tests. Not itself a scheduling
    /// invariant, but shares the Store connection with everything above.
    async fn get_status(&self, public_id: &PublicId) -> Result<Option<SubmissionSnapshot>>;
}

/// A read-only snapshot of a submission's scheduling-relevant fields.
#[derive(Debug, Clone)]
pub struct SubmissionSnapshot {
    pub public_id: PublicId,
    pub status: Status,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub attempt_telegram_ingest: i32,
    pub attempt_normalization: i32,
    pub attempt_evaluation: i32,
    pub attempt_delivery: i32,
}

impl SubmissionSnapshot {
    /// The attempt counter for `stage`, selected at compile time.
    pub fn attempt_for(&self, stage: Stage) -> i32 {
        match stage {
            Stage::TelegramIngest => self.attempt_telegram_ingest,
            Stage::Normalize => self.attempt_normalization,
            Stage::Evaluate => self.attempt_evaluation,
            Stage::Deliver => self.attempt_delivery,
        }
    }
}
