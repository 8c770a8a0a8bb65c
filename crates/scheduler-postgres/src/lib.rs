//! PostgreSQL implementation of the submission pipeline's claim scheduler.
//!
//! This crate provides a production [`ClaimRepository`] implementation on top of `sqlx`.
//!
//! # Features
//!
//! - `FOR UPDATE SKIP LOCKED` claiming, contention-free under many concurrent workers
//! - Lease-gated updates: every mutating statement's `WHERE` clause re-checks `claimed_by` and
//!   `status`, so a worker that lost its lease cannot silently clobber a reclaimed row
//! - Per-stage attempt counters selected via literal, precomputed SQL text — never built by
//!   interpolating a column name into a query string at runtime
//! - Bounded batch reclaim of lease-expired claims, split between retry and dead-letter by
//!   remaining attempt budget
//!
//! # Database Schema
//!
//! See `migrations/0001_submissions.sql` and `migrations/0002_domain_tables.sql`.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{
    Artifact, ArtifactRef, Claim, ClaimRepository, PublicId, Result, SchedulerError, Stage,
    Status, SubmissionSnapshot,
};
use sqlx::{PgPool, Row};

/// PostgreSQL-backed [`ClaimRepository`].
#[derive(Clone)]
pub struct PgClaimRepository {
    pool: PgPool,
}

impl PgClaimRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unavailable(err: sqlx::Error) -> SchedulerError {
    SchedulerError::Unavailable(anyhow::Error::new(err))
}

#[async_trait]
impl ClaimRepository for PgClaimRepository {
    async fn claim_next(
        &self,
        expected_status: Status,
        in_progress_status: Status,
        worker_id: &str,
        lease_seconds: i64,
        stage: Stage,
    ) -> Result<Option<Claim>> {
        let lease_expires_at = Utc::now() + Duration::seconds(lease_seconds);
        // attempt_col is one of four fixed literals selected by Stage::attempt_column's match, not
        // a value that varies with caller input, so splicing it into the RETURNING clause here
        // carries none of the risk a caller-controlled column name would.
        let attempt_col = stage.attempt_column();

        let row = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM submissions
                WHERE status = $1
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE submissions
            SET status = $2,
                claimed_by = $3,
                claimed_at = NOW(),
                lease_expires_at = $4,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING public_id, {attempt_col} AS attempt
            "#
        ))
        .bind(expected_status.as_str())
        .bind(in_progress_status.as_str())
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| Claim {
            public_id: PublicId::from_raw(row.get::<String, _>("public_id")),
            stage,
            attempt: row.get("attempt"),
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
        let lease_expires_at = Utc::now() + Duration::seconds(lease_seconds);

        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET lease_expires_at = $1,
                updated_at = NOW()
            WHERE public_id = $2
              AND status = $3
              AND claimed_by = $4
              AND lease_expires_at > NOW()
            "#,
        )
        .bind(lease_expires_at)
        .bind(public_id.as_str())
        .bind(in_progress_status.as_str())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn finalize_success(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        success_status: Status,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET status = $1,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = NULL,
                last_error_message = NULL,
                updated_at = NOW()
            WHERE public_id = $2
              AND status = $3
              AND claimed_by = $4
              AND lease_expires_at > NOW()
            "#,
        )
        .bind(success_status.as_str())
        .bind(public_id.as_str())
        .bind(in_progress_status.as_str())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
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

        let result = sqlx::query(finalize_failure_retry_sql(stage))
            .bind(failed_status.as_str())
            .bind(error_code)
            .bind(error_message)
            .bind(public_id.as_str())
            .bind(in_progress_status.as_str())
            .bind(worker_id)
            .bind(max_attempts)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn finalize_failure_terminal(
        &self,
        public_id: &PublicId,
        in_progress_status: Status,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let locked = sqlx::query(
            r#"
            SELECT id FROM submissions
            WHERE public_id = $1 AND status = $2 AND claimed_by = $3 AND lease_expires_at > NOW()
            FOR UPDATE
            "#,
        )
        .bind(public_id.as_str())
        .bind(in_progress_status.as_str())
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        if locked.is_none() {
            tx.commit().await.map_err(unavailable)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE submissions
            SET status = 'dead_letter',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $1,
                last_error_message = $2,
                updated_at = NOW()
            WHERE public_id = $3
            "#,
        )
        .bind(error_code)
        .bind(error_message)
        .bind(public_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
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

        let rows = sqlx::query(reclaim_expired_retry_sql(stage))
            .bind(in_progress_status.as_str())
            .bind(failed_status.as_str())
            .bind(error_code)
            .bind(error_message)
            .bind(max_attempts)
            .bind(batch_limit)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|row| PublicId::from_raw(row.get::<String, _>("public_id")))
            .collect())
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

        let rows = sqlx::query(reclaim_expired_dead_letter_sql(stage))
            .bind(in_progress_status.as_str())
            .bind(error_code)
            .bind(error_message)
            .bind(max_attempts)
            .bind(batch_limit)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|row| PublicId::from_raw(row.get::<String, _>("public_id")))
            .collect())
    }

    async fn transition_state(
        &self,
        public_id: &PublicId,
        from_status: Status,
        to_status: Status,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET status = $1, updated_at = NOW()
            WHERE public_id = $2 AND status = $3
            "#,
        )
        .bind(to_status.as_str())
        .bind(public_id.as_str())
        .bind(from_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn link_artifact(
        &self,
        public_id: &PublicId,
        stage: Stage,
        bucket: &str,
        object_key: &str,
        schema_version: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (submission_public_id, stage, bucket, object_key, schema_version)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(public_id.as_str())
        .bind(stage.as_str())
        .bind(bucket)
        .bind(object_key)
        .bind(schema_version)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn get_artifact_ref(
        &self,
        public_id: &PublicId,
        stage: Stage,
    ) -> Result<Option<ArtifactRef>> {
        let row = sqlx::query(
            r#"
            SELECT bucket, object_key, schema_version
            FROM artifacts
            WHERE submission_public_id = $1 AND stage = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(public_id.as_str())
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| ArtifactRef {
            bucket: row.get("bucket"),
            object_key: row.get("object_key"),
            schema_version: row.get("schema_version"),
        }))
    }

    async fn list_artifacts(&self, public_id: &PublicId) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            r#"
            SELECT id, stage, bucket, object_key, schema_version, created_at
            FROM artifacts
            WHERE submission_public_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(public_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter()
            .map(|row| {
                let stage_str: String = row.get("stage");
                let stage = parse_stage(&stage_str).with_context(|| {
                    format!("artifact row for {public_id} has unrecognized stage {stage_str}")
                })?;
                Ok(Artifact {
                    id: row.get("id"),
                    submission_id: public_id.clone(),
                    stage,
                    bucket: row.get("bucket"),
                    object_key: row.get("object_key"),
                    schema_version: row.get("schema_version"),
                    created_at: row.get("created_at"),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(SchedulerError::Unavailable)
    }

    async fn get_status(&self, public_id: &PublicId) -> Result<Option<SubmissionSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT status, claimed_by, claimed_at, lease_expires_at,
                   last_error_code, last_error_message,
                   attempt_telegram_ingest, attempt_normalization,
                   attempt_evaluation, attempt_delivery
            FROM submissions
            WHERE public_id = $1
            "#,
        )
        .bind(public_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_str: String = row.get("status");
        let status = Status::parse(&status_str).with_context(|| {
            format!("submission {public_id} has unrecognized status {status_str}")
        })?;

        Ok(Some(SubmissionSnapshot {
            public_id: public_id.clone(),
            status,
            claimed_by: row.get("claimed_by"),
            claimed_at: row.get::<Option<DateTime<Utc>>, _>("claimed_at"),
            lease_expires_at: row.get::<Option<DateTime<Utc>>, _>("lease_expires_at"),
            last_error_code: row.get("last_error_code"),
            last_error_message: row.get("last_error_message"),
            attempt_telegram_ingest: row.get("attempt_telegram_ingest"),
            attempt_normalization: row.get("attempt_normalization"),
            attempt_evaluation: row.get("attempt_evaluation"),
            attempt_delivery: row.get("attempt_delivery"),
        }))
    }
}

fn parse_stage(s: &str) -> anyhow::Result<Stage> {
    Stage::ALL
        .into_iter()
        .find(|stage| stage.as_str() == s)
        .ok_or_else(|| anyhow::anyhow!("unrecognized stage {s}"))
}

// The four statements below are intentionally written out per stage rather than assembled with
// `format!("{}", stage.attempt_column())`: the column name is fixed at compile time, selected by
// matching on `stage`, never built from a runtime value.

fn finalize_failure_retry_sql(stage: Stage) -> &'static str {
    match stage {
        Stage::TelegramIngest => {
            r#"
            UPDATE submissions
            SET status = $1,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                attempt_telegram_ingest = attempt_telegram_ingest + 1,
                updated_at = NOW()
            WHERE public_id = $4
              AND status = $5
              AND claimed_by = $6
              AND attempt_telegram_ingest + 1 < $7
              AND lease_expires_at > NOW()
            "#
        }
        Stage::Normalize => {
            r#"
            UPDATE submissions
            SET status = $1,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                attempt_normalization = attempt_normalization + 1,
                updated_at = NOW()
            WHERE public_id = $4
              AND status = $5
              AND claimed_by = $6
              AND attempt_normalization + 1 < $7
              AND lease_expires_at > NOW()
            "#
        }
        Stage::Evaluate => {
            r#"
            UPDATE submissions
            SET status = $1,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                attempt_evaluation = attempt_evaluation + 1,
                updated_at = NOW()
            WHERE public_id = $4
              AND status = $5
              AND claimed_by = $6
              AND attempt_evaluation + 1 < $7
              AND lease_expires_at > NOW()
            "#
        }
        Stage::Deliver => {
            r#"
            UPDATE submissions
            SET status = $1,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                attempt_delivery = attempt_delivery + 1,
                updated_at = NOW()
            WHERE public_id = $4
              AND status = $5
              AND claimed_by = $6
              AND attempt_delivery + 1 < $7
              AND lease_expires_at > NOW()
            "#
        }
    }
}

// Reclaim statements bound to `batch_limit` (the last placeholder) via the same
// `WITH candidates AS (... FOR UPDATE SKIP LOCKED LIMIT $n) UPDATE ... WHERE id IN (...)` shape as
// `claim_next`, so a reclaim tick never locks more rows than `WORKER_RECLAIM_BATCH_LIMIT` allows
// and never blocks on rows a concurrent reclaimer already holds.

fn reclaim_expired_retry_sql(stage: Stage) -> &'static str {
    match stage {
        Stage::TelegramIngest => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_telegram_ingest + 1 < $5
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $6
            )
            UPDATE submissions
            SET status = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $3,
                last_error_message = $4,
                attempt_telegram_ingest = attempt_telegram_ingest + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
        Stage::Normalize => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_normalization + 1 < $5
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $6
            )
            UPDATE submissions
            SET status = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $3,
                last_error_message = $4,
                attempt_normalization = attempt_normalization + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
        Stage::Evaluate => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_evaluation + 1 < $5
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $6
            )
            UPDATE submissions
            SET status = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $3,
                last_error_message = $4,
                attempt_evaluation = attempt_evaluation + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
        Stage::Deliver => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_delivery + 1 < $5
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $6
            )
            UPDATE submissions
            SET status = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $3,
                last_error_message = $4,
                attempt_delivery = attempt_delivery + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
    }
}

fn reclaim_expired_dead_letter_sql(stage: Stage) -> &'static str {
    match stage {
        Stage::TelegramIngest => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_telegram_ingest + 1 >= $4
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $5
            )
            UPDATE submissions
            SET status = 'dead_letter',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
        Stage::Normalize => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_normalization + 1 >= $4
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $5
            )
            UPDATE submissions
            SET status = 'dead_letter',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
        Stage::Evaluate => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_evaluation + 1 >= $4
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $5
            )
            UPDATE submissions
            SET status = 'dead_letter',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
        Stage::Deliver => {
            r#"
            WITH candidates AS (
                SELECT id FROM submissions
                WHERE status = $1
                  AND lease_expires_at < NOW()
                  AND attempt_delivery + 1 >= $4
                ORDER BY lease_expires_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $5
            )
            UPDATE submissions
            SET status = 'dead_letter',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING public_id
            "#
        }
    }
}
