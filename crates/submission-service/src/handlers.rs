//! Stand-in stage handlers.
//!
//! Per-stage business logic (parsing a Telegram file, normalizing submitted text, calling the
//! LLM, rendering and sending feedback) is an external collaborator this service only defines the
//! contract for — see `demos/llm-evaluate-handler` and `demos/artifact-fetch-handler` for worked
//! examples of a real handler wired to a real client. The handlers below satisfy the
//! [`StageHandler`] contract well enough to run the pipeline end-to-end against the Store, and are
//! the seam where a deployment plugs in its actual adapters.

use async_trait::async_trait;
use scheduler_core::{ArtifactRef, Claim, ClaimRepository, ErrorKind, ProcessResult, Stage, StageHandler};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Dependencies shared by every stand-in handler in this binary.
pub struct ServiceDeps {
    pub pool: PgPool,
    pub repository: std::sync::Arc<dyn ClaimRepository>,
}

pub struct TelegramIngestHandler;

#[async_trait]
impl StageHandler<ServiceDeps> for TelegramIngestHandler {
    async fn process(&self, claim: &Claim, _deps: &ServiceDeps, _cancel: &CancellationToken) -> ProcessResult {
        debug!(public_id = %claim.public_id, "telegram_ingest: stand-in handler, no file fetch performed");
        ProcessResult::success_with_artifact(ArtifactRef {
            bucket: "inbox".to_string(),
            object_key: format!("{}/raw", claim.public_id),
            schema_version: 1,
        })
    }
}

pub struct NormalizeHandler;

#[async_trait]
impl StageHandler<ServiceDeps> for NormalizeHandler {
    async fn process(&self, claim: &Claim, deps: &ServiceDeps, _cancel: &CancellationToken) -> ProcessResult {
        match deps.repository.get_artifact_ref(&claim.public_id, Stage::TelegramIngest).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return ProcessResult::failure(ErrorKind::PermanentBadInput, "no raw upload to normalize")
            }
            Err(err) => return ProcessResult::failure(ErrorKind::RetryableResource, err.to_string()),
        }

        ProcessResult::success_with_artifact(ArtifactRef {
            bucket: "normalized".to_string(),
            object_key: format!("{}/normalized", claim.public_id),
            schema_version: 1,
        })
    }
}

pub struct EvaluateHandler;

#[async_trait]
impl StageHandler<ServiceDeps> for EvaluateHandler {
    async fn process(&self, claim: &Claim, deps: &ServiceDeps, _cancel: &CancellationToken) -> ProcessResult {
        match deps.repository.get_artifact_ref(&claim.public_id, Stage::Normalize).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return ProcessResult::failure(ErrorKind::PermanentBadInput, "no normalized artifact to evaluate")
            }
            Err(err) => return ProcessResult::failure(ErrorKind::RetryableResource, err.to_string()),
        }

        let result = sqlx::query(
            r#"
            INSERT INTO evaluations (submission_public_id, score, criterion_scores, feedback)
            VALUES ($1, $2, '{}'::jsonb, '{}'::jsonb)
            ON CONFLICT (submission_public_id) DO UPDATE SET score = EXCLUDED.score, updated_at = NOW()
            "#,
        )
        .bind(claim.public_id.as_str())
        .bind(0.0_f64)
        .execute(&deps.pool)
        .await;

        if let Err(err) = result {
            return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string());
        }

        ProcessResult::success_with_artifact(ArtifactRef {
            bucket: "evaluations".to_string(),
            object_key: format!("{}/evaluation", claim.public_id),
            schema_version: 1,
        })
    }
}

pub struct DeliverHandler;

#[async_trait]
impl StageHandler<ServiceDeps> for DeliverHandler {
    async fn process(&self, claim: &Claim, deps: &ServiceDeps, _cancel: &CancellationToken) -> ProcessResult {
        match deps.repository.get_artifact_ref(&claim.public_id, Stage::Evaluate).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return ProcessResult::failure(ErrorKind::PermanentBadInput, "no evaluation to deliver")
            }
            Err(err) => return ProcessResult::failure(ErrorKind::RetryableResource, err.to_string()),
        }

        let result = sqlx::query(
            r#"
            INSERT INTO deliveries (submission_public_id, channel, external_message_id)
            VALUES ($1, 'stand_in', NULL)
            "#,
        )
        .bind(claim.public_id.as_str())
        .execute(&deps.pool)
        .await;

        if let Err(err) = result {
            return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string());
        }

        ProcessResult::success()
    }
}
