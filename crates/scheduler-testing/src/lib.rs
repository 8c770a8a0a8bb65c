//! An in-memory [`ClaimRepository`] for exercising [`scheduler_core::WorkerLoop`] and
//! [`scheduler_core::Runner`] without a database.
//!
//! This mirrors the real Postgres repository's contract exactly — same lease-gated
//! compare-and-swap semantics, same attempt-counter bookkeeping — so a test written against
//! [`InMemoryClaimRepository`] exercises the same state machine the Postgres implementation
//! enforces with `WHERE` clauses; it just enforces it with a `Mutex` instead.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{
    Artifact, ArtifactRef, Claim, ClaimRepository, PublicId, Result, SchedulerError, Stage,
    Status, SubmissionSnapshot,
};

#[derive(Debug, Clone)]
struct Row {
    status: Status,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    attempts: [i32; 4],
    created_at: DateTime<Utc>,
}

impl Row {
    fn new(status: Status, created_at: DateTime<Utc>) -> Self {
        Self {
            status,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            last_error_code: None,
            last_error_message: None,
            attempts: [0; 4],
            created_at,
        }
    }

    fn attempt(&self, stage: Stage) -> i32 {
        self.attempts[stage_index(stage)]
    }

    /// Mirrors the `lease_expires_at > NOW()` conjunct every lease-gated Postgres statement
    /// carries (§4.1): a lease that has expired but hasn't been reclaimed yet is not valid.
    fn lease_valid(&self) -> bool {
        self.lease_expires_at.is_some_and(|expires_at| expires_at > Utc::now())
    }
}

fn stage_index(stage: Stage) -> usize {
    match stage {
        Stage::TelegramIngest => 0,
        Stage::Normalize => 1,
        Stage::Evaluate => 2,
        Stage::Deliver => 3,
    }
}

#[derive(Debug, Clone)]
struct ArtifactRow {
    id: i64,
    submission_id: PublicId,
    stage: Stage,
    bucket: String,
    object_key: String,
    schema_version: i32,
    created_at: DateTime<Utc>,
}

/// An in-process, `Mutex`-guarded [`ClaimRepository`]. A fresh clock tick per call stands in for
/// `NOW()`; there is no wall-clock skew to account for since everything runs in one process.
#[derive(Default)]
pub struct InMemoryClaimRepository {
    submissions: Mutex<HashMap<String, Row>>,
    artifacts: Mutex<Vec<ArtifactRow>>,
    next_artifact_id: Mutex<i64>,
}

impl InMemoryClaimRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a submission directly into `status`, bypassing the claim state machine. Returns the
    /// minted [`PublicId`] so the caller can drive it through a [`scheduler_core::WorkerLoop`].
    pub fn seed(&self, status: Status) -> PublicId {
        let public_id = PublicId::generate("sub");
        self.submissions
            .lock()
            .unwrap()
            .insert(public_id.as_str().to_string(), Row::new(status, Utc::now()));
        public_id
    }

    /// Seed a submission already claimed by `worker_id`, with its lease set to expire `ago`
    /// seconds in the past — for exercising reclaim paths without sleeping in tests.
    pub fn seed_claimed_with_expired_lease(
        &self,
        status: Status,
        worker_id: &str,
        attempt: i32,
        stage: Stage,
        expired_seconds_ago: i64,
    ) -> PublicId {
        let public_id = PublicId::generate("sub");
        let mut row = Row::new(status, Utc::now() - Duration::seconds(60));
        row.claimed_by = Some(worker_id.to_string());
        row.claimed_at = Some(Utc::now() - Duration::seconds(expired_seconds_ago + 60));
        row.lease_expires_at = Some(Utc::now() - Duration::seconds(expired_seconds_ago));
        row.attempts[stage_index(stage)] = attempt;
        self.submissions
            .lock()
            .unwrap()
            .insert(public_id.as_str().to_string(), row);
        public_id
    }
}

#[async_trait]
impl ClaimRepository for InMemoryClaimRepository {
    async fn claim_next(
        &self,
        expected_status: Status,
        in_progress_status: Status,
        worker_id: &str,
        lease_seconds: i64,
        stage: Stage,
    ) -> Result<Option<Claim>> {
        let mut submissions = self.submissions.lock().unwrap();
        let oldest = submissions
            .iter_mut()
            .filter(|(_, row)| row.status == expected_status)
            .min_by_key(|(_, row)| row.created_at)
            .map(|(id, _)| id.clone());

        let Some(id) = oldest else {
            return Ok(None);
        };
        let row = submissions.get_mut(&id).unwrap();

        let lease_expires_at = Utc::now() + Duration::seconds(lease_seconds);
        row.status = in_progress_status;
        row.claimed_by = Some(worker_id.to_string());
        row.claimed_at = Some(Utc::now());
        row.lease_expires_at = Some(lease_expires_at);

        Ok(Some(Claim {
            public_id: PublicId::from_raw(id),
            stage,
            attempt: row.attempt(stage),
            worker_id: worker_id.to_string(),
            lease_expires_at,
        }))
    }

    async fn heartbeat_claim(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool> {
        let mut submissions = self.submissions.lock().unwrap();
        let Some(row) = submissions.get_mut(public_id.as_str()) else {
            return Ok(false);
        };
        if row.status != in_progress_status
            || row.claimed_by.as_deref() != Some(worker_id)
            || !row.lease_valid()
        {
            return Ok(false);
        }
        row.lease_expires_at = Some(Utc::now() + Duration::seconds(lease_seconds));
        Ok(true)
    }

    async fn finalize_success(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        success_status: Status,
    ) -> Result<bool> {
        let mut submissions = self.submissions.lock().unwrap();
        let Some(row) = submissions.get_mut(public_id.as_str()) else {
            return Ok(false);
        };
        if row.status != in_progress_status
            || row.claimed_by.as_deref() != Some(worker_id)
            || !row.lease_valid()
        {
            return Ok(false);
        }
        row.status = success_status;
        row.claimed_by = None;
        row.claimed_at = None;
        row.lease_expires_at = None;
        row.last_error_code = None;
        row.last_error_message = None;
        Ok(true)
    }

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
    ) -> Result<bool> {
        if max_attempts < 1 {
            return Err(SchedulerError::InvalidMaxAttempts(max_attempts));
        }
        let mut submissions = self.submissions.lock().unwrap();
        let Some(row) = submissions.get_mut(public_id.as_str()) else {
            return Ok(false);
        };
        if row.status != in_progress_status
            || row.claimed_by.as_deref() != Some(worker_id)
            || !row.lease_valid()
        {
            return Ok(false);
        }
        if row.attempt(stage) + 1 >= max_attempts {
            return Ok(false);
        }
        row.status = failed_status;
        row.claimed_by = None;
        row.claimed_at = None;
        row.lease_expires_at = None;
        row.last_error_code = Some(error_code.to_string());
        row.last_error_message = Some(error_message.to_string());
        row.attempts[stage_index(stage)] += 1;
        Ok(true)
    }

    async fn finalize_failure_terminal(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool> {
        let mut submissions = self.submissions.lock().unwrap();
        let Some(row) = submissions.get_mut(public_id.as_str()) else {
            return Ok(false);
        };
        if row.status != in_progress_status
            || row.claimed_by.as_deref() != Some(worker_id)
            || !row.lease_valid()
        {
            return Ok(false);
        }
        row.status = Status::DeadLetter;
        row.claimed_by = None;
        row.claimed_at = None;
        row.lease_expires_at = None;
        row.last_error_code = Some(error_code.to_string());
        row.last_error_message = Some(error_message.to_string());
        Ok(true)
    }

    async fn reclaim_expired_retry(
        &self,
        in_progress_status: Status,
        failed_status: Status,
        error_code: &str,
        error_message: &str,
        max_attempts: i32,
        stage: Stage,
        batch_limit: i64,
    ) -> Result<Vec<PublicId>> {
        if max_attempts < 1 {
            return Err(SchedulerError::InvalidMaxAttempts(max_attempts));
        }
        let now = Utc::now();
        let mut submissions = self.submissions.lock().unwrap();
        let mut candidates: Vec<(String, DateTime<Utc>)> = submissions
            .iter()
            .filter(|(_, row)| {
                row.status == in_progress_status
                    && row.lease_expires_at.is_some_and(|expires_at| expires_at < now)
                    && row.attempt(stage) + 1 < max_attempts
            })
            .map(|(id, row)| (id.clone(), row.lease_expires_at.unwrap()))
            .collect();
        candidates.sort_by_key(|(_, expires_at)| *expires_at);
        candidates.truncate(batch_limit.max(0) as usize);

        let mut reclaimed = Vec::new();
        for (id, _) in candidates {
            let row = submissions.get_mut(&id).unwrap();
            row.status = failed_status;
            row.claimed_by = None;
            row.claimed_at = None;
            row.lease_expires_at = None;
            row.last_error_code = Some(error_code.to_string());
            row.last_error_message = Some(error_message.to_string());
            row.attempts[stage_index(stage)] += 1;
            reclaimed.push(PublicId::from_raw(id));
        }
        Ok(reclaimed)
    }

    async fn reclaim_expired_dead_letter(
        &self,
        in_progress_status: Status,
        error_code: &str,
        error_message: &str,
        max_attempts: i32,
        stage: Stage,
        batch_limit: i64,
    ) -> Result<Vec<PublicId>> {
        if max_attempts < 1 {
            return Err(SchedulerError::InvalidMaxAttempts(max_attempts));
        }
        let now = Utc::now();
        let mut submissions = self.submissions.lock().unwrap();
        let mut candidates: Vec<(String, DateTime<Utc>)> = submissions
            .iter()
            .filter(|(_, row)| {
                row.status == in_progress_status
                    && row.lease_expires_at.is_some_and(|expires_at| expires_at < now)
                    && row.attempt(stage) + 1 >= max_attempts
            })
            .map(|(id, row)| (id.clone(), row.lease_expires_at.unwrap()))
            .collect();
        candidates.sort_by_key(|(_, expires_at)| *expires_at);
        candidates.truncate(batch_limit.max(0) as usize);

        let mut reclaimed = Vec::new();
        for (id, _) in candidates {
            let row = submissions.get_mut(&id).unwrap();
            row.status = Status::DeadLetter;
            row.claimed_by = None;
            row.claimed_at = None;
            row.lease_expires_at = None;
            row.last_error_code = Some(error_code.to_string());
            row.last_error_message = Some(error_message.to_string());
            reclaimed.push(PublicId::from_raw(id));
        }
        Ok(reclaimed)
    }

    async fn transition_state(
        &self,
        public_id: &PublicId,
        from_status: Status,
        to_status: Status,
    ) -> Result<bool> {
        let mut submissions = self.submissions.lock().unwrap();
        let Some(row) = submissions.get_mut(public_id.as_str()) else {
            return Ok(false);
        };
        if row.status != from_status {
            return Ok(false);
        }
        row.status = to_status;
        Ok(true)
    }

    async fn link_artifact(
        &self,
        public_id: &PublicId,
        stage: Stage,
        bucket: &str,
        object_key: &str,
        schema_version: i32,
    ) -> Result<()> {
        let mut next_id = self.next_artifact_id.lock().unwrap();
        *next_id += 1;
        self.artifacts.lock().unwrap().push(ArtifactRow {
            id: *next_id,
            submission_id: public_id.clone(),
            stage,
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            schema_version,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_artifact_ref(
        &self,
        public_id: &PublicId,
        stage: Stage,
    ) -> Result<Option<ArtifactRef>> {
        let artifacts = self.artifacts.lock().unwrap();
        let latest = artifacts
            .iter()
            .filter(|row| row.submission_id == *public_id && row.stage == stage)
            .max_by_key(|row| (row.created_at, row.id));
        Ok(latest.map(|row| ArtifactRef {
            bucket: row.bucket.clone(),
            object_key: row.object_key.clone(),
            schema_version: row.schema_version,
        }))
    }

    async fn list_artifacts(&self, public_id: &PublicId) -> Result<Vec<Artifact>> {
        let mut rows: Vec<Artifact> = self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.submission_id == *public_id)
            .map(|row| Artifact {
                id: row.id,
                submission_id: row.submission_id.clone(),
                stage: row.stage,
                bucket: row.bucket.clone(),
                object_key: row.object_key.clone(),
                schema_version: row.schema_version,
                created_at: row.created_at,
            })
            .collect();
        rows.sort_by_key(|row| (row.created_at, row.id));
        Ok(rows)
    }

    async fn get_status(&self, public_id: &PublicId) -> Result<Option<SubmissionSnapshot>> {
        let submissions = self.submissions.lock().unwrap();
        Ok(submissions.get(public_id.as_str()).map(|row| SubmissionSnapshot {
            public_id: public_id.clone(),
            status: row.status,
            claimed_by: row.claimed_by.clone(),
            claimed_at: row.claimed_at,
            lease_expires_at: row.lease_expires_at,
            last_error_code: row.last_error_code.clone(),
            last_error_message: row.last_error_message.clone(),
            attempt_telegram_ingest: row.attempts[0],
            attempt_normalization: row.attempts[1],
            attempt_evaluation: row.attempts[2],
            attempt_delivery: row.attempts[3],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::{HandlerDeps, ProcessResult, StageHandler, WorkerLoop, WorkerLoopConfig};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct AlwaysSucceeds;

    #[async_trait]
    impl<D: HandlerDeps> StageHandler<D> for AlwaysSucceeds {
        async fn process(&self, _claim: &Claim, _deps: &D, _cancel: &CancellationToken) -> ProcessResult {
            ProcessResult::success()
        }
    }

    struct AlwaysBadInput;

    #[async_trait]
    impl<D: HandlerDeps> StageHandler<D> for AlwaysBadInput {
        async fn process(&self, _claim: &Claim, _deps: &D, _cancel: &CancellationToken) -> ProcessResult {
            ProcessResult::failure(scheduler_core::ErrorKind::PermanentBadInput, "malformed payload")
        }
    }

    struct AlwaysBusinessOutcome;

    #[async_trait]
    impl<D: HandlerDeps> StageHandler<D> for AlwaysBusinessOutcome {
        async fn process(&self, _claim: &Claim, _deps: &D, _cancel: &CancellationToken) -> ProcessResult {
            ProcessResult::failure(scheduler_core::ErrorKind::PermanentBusiness, "no feedback to give")
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl<D: HandlerDeps> StageHandler<D> for AlwaysFails {
        async fn process(&self, _claim: &Claim, _deps: &D, _cancel: &CancellationToken) -> ProcessResult {
            ProcessResult::failure(scheduler_core::ErrorKind::RetryableTransient, "boom")
        }
    }

    fn loop_config(stage: Stage) -> WorkerLoopConfig {
        WorkerLoopConfig {
            stage,
            worker_id: "test-worker".to_string(),
            lease_seconds: 30,
            heartbeat_interval_ms: 5_000,
            max_attempts: 3,
            reclaim_batch_limit: 100,
        }
    }

    #[tokio::test]
    async fn happy_path_claims_processes_and_finalizes() {
        let repo = Arc::new(InMemoryClaimRepository::new());
        let public_id = repo.seed(Status::TelegramUpdateReceived);

        let worker_loop = WorkerLoop::new(
            repo.clone() as Arc<dyn ClaimRepository>,
            AlwaysSucceeds,
            (),
            loop_config(Stage::TelegramIngest),
        );
        let outcome = worker_loop.run_once().await.unwrap();
        assert!(outcome.did_work);

        let snapshot = repo.get_status(&public_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Uploaded);
        assert!(snapshot.claimed_by.is_none());
    }

    #[tokio::test]
    async fn failure_retries_until_attempts_exhausted_then_dead_letters() {
        let repo = Arc::new(InMemoryClaimRepository::new());
        let public_id = repo.seed(Status::Uploaded);

        let worker_loop = WorkerLoop::new(
            repo.clone() as Arc<dyn ClaimRepository>,
            AlwaysFails,
            (),
            loop_config(Stage::Normalize),
        );

        for _ in 0..2 {
            let outcome = worker_loop.run_once().await.unwrap();
            assert!(outcome.did_work);
            let snapshot = repo.get_status(&public_id).await.unwrap().unwrap();
            assert_eq!(snapshot.status, Status::FailedNormalization);
            // Requeue for the next attempt, as ingress / a reclaim pass normally would.
            repo.transition_state(&public_id, Status::FailedNormalization, Status::Uploaded)
                .await
                .unwrap();
        }

        let outcome = worker_loop.run_once().await.unwrap();
        assert!(outcome.did_work);
        let snapshot = repo.get_status(&public_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::DeadLetter);
    }

    #[tokio::test]
    async fn permanent_bad_input_dead_letters_on_the_first_attempt() {
        let repo = Arc::new(InMemoryClaimRepository::new());
        let public_id = repo.seed(Status::Uploaded);

        let worker_loop = WorkerLoop::new(
            repo.clone() as Arc<dyn ClaimRepository>,
            AlwaysBadInput,
            (),
            loop_config(Stage::Normalize),
        );
        let outcome = worker_loop.run_once().await.unwrap();
        assert!(outcome.did_work);

        let snapshot = repo.get_status(&public_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::DeadLetter, "bad input must not be retried");
        assert_eq!(snapshot.attempt_normalization, 0, "a single-attempt terminal never touches the attempt counter");
        assert_eq!(snapshot.last_error_code.as_deref(), Some("permanent_bad_input"));
    }

    #[tokio::test]
    async fn permanent_business_outcome_finalizes_as_success() {
        let repo = Arc::new(InMemoryClaimRepository::new());
        let public_id = repo.seed(Status::Normalized);

        let worker_loop = WorkerLoop::new(
            repo.clone() as Arc<dyn ClaimRepository>,
            AlwaysBusinessOutcome,
            (),
            loop_config(Stage::Evaluate),
        );
        let outcome = worker_loop.run_once().await.unwrap();
        assert!(outcome.did_work);

        let snapshot = repo.get_status(&public_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Evaluated, "a business outcome is a success, not a failure");
        assert!(snapshot.claimed_by.is_none());
        assert!(snapshot.last_error_code.is_none());
    }

    #[tokio::test]
    async fn concurrent_workers_never_double_claim() {
        let repo = Arc::new(InMemoryClaimRepository::new());
        repo.seed(Status::Normalized);

        let mut handles = Vec::new();
        for n in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let worker_loop = WorkerLoop::new(
                    repo as Arc<dyn ClaimRepository>,
                    AlwaysSucceeds,
                    (),
                    WorkerLoopConfig {
                        worker_id: format!("worker-{n}"),
                        ..loop_config(Stage::Evaluate)
                    },
                );
                worker_loop.run_once().await.unwrap().did_work
            }));
        }

        let mut claims = 0;
        for handle in handles {
            if handle.await.unwrap() {
                claims += 1;
            }
        }
        assert_eq!(claims, 1, "exactly one worker should have claimed the single ready row");
    }

    #[tokio::test]
    async fn reclaim_expired_retry_requeues_an_orphaned_claim() {
        let repo = InMemoryClaimRepository::new();
        let public_id =
            repo.seed_claimed_with_expired_lease(Status::EvaluationInProgress, "dead-worker", 0, Stage::Evaluate, 5);

        let reclaimed = repo
            .reclaim_expired_retry(
                Status::EvaluationInProgress,
                Status::FailedEvaluation,
                "lease_expired",
                "worker heartbeat stopped",
                3,
                Stage::Evaluate,
                100,
            )
            .await
            .unwrap();

        assert_eq!(reclaimed, vec![public_id.clone()]);
        let snapshot = repo.get_status(&public_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::FailedEvaluation);
        assert_eq!(snapshot.attempt_evaluation, 1);
    }

    #[tokio::test]
    async fn reclaim_batch_limit_bounds_rows_moved_per_call() {
        let repo = InMemoryClaimRepository::new();
        for _ in 0..5 {
            repo.seed_claimed_with_expired_lease(Status::EvaluationInProgress, "dead-worker", 0, Stage::Evaluate, 5);
        }

        let reclaimed = repo
            .reclaim_expired_retry(
                Status::EvaluationInProgress,
                Status::FailedEvaluation,
                "lease_expired",
                "worker heartbeat stopped",
                3,
                Stage::Evaluate,
                2,
            )
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 2, "batch_limit should cap rows moved in one call");

        let reclaimed_rest = repo
            .reclaim_expired_retry(
                Status::EvaluationInProgress,
                Status::FailedEvaluation,
                "lease_expired",
                "worker heartbeat stopped",
                3,
                Stage::Evaluate,
                100,
            )
            .await
            .unwrap();
        assert_eq!(reclaimed_rest.len(), 3, "a second call picks up what the first left behind");
    }
}
