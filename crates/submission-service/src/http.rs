//! The thin HTTP ingress surface (§6, §11): handlers call `transition_state`/insert helpers and
//! return the row, with no business logic duplicated from the stage handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use scheduler_core::{ClaimRepository, PublicId, RunnerMetricsSnapshot, Status};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub repository: Arc<dyn ClaimRepository>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/candidates", post(create_candidate))
        .route("/assignments", post(create_assignment).get(list_assignments))
        .route("/submissions", post(create_submission))
        .route("/submissions/file", post(create_submission_from_file))
        .route("/submissions/:id", get(get_submission))
        .route("/webhooks/telegram", post(telegram_webhook))
        .route("/feedback", get(list_feedback))
        .route("/exports", post(create_export))
        .route("/exports/:id/download", get(download_export))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct CreateCandidateRequest {
    name: String,
}

#[derive(Serialize)]
struct PublicIdResponse {
    public_id: String,
}

async fn create_candidate(
    State(state): State<AppState>,
    Json(body): Json<CreateCandidateRequest>,
) -> Result<Json<PublicIdResponse>, ApiError> {
    let public_id = PublicId::generate("cand");
    sqlx::query("INSERT INTO candidates (public_id, name) VALUES ($1, $2)")
        .bind(public_id.as_str())
        .bind(&body.name)
        .execute(&state.pool)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(PublicIdResponse {
        public_id: public_id.to_string(),
    }))
}

#[derive(Deserialize)]
struct CreateAssignmentRequest {
    title: String,
}

async fn create_assignment(
    State(state): State<AppState>,
    Json(body): Json<CreateAssignmentRequest>,
) -> Result<Json<PublicIdResponse>, ApiError> {
    let public_id = PublicId::generate("asg");
    sqlx::query("INSERT INTO assignments (public_id, title) VALUES ($1, $2)")
        .bind(public_id.as_str())
        .bind(&body.title)
        .execute(&state.pool)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(PublicIdResponse {
        public_id: public_id.to_string(),
    }))
}

#[derive(Serialize, sqlx::FromRow)]
struct AssignmentRow {
    public_id: String,
    title: String,
}

async fn list_assignments(State(state): State<AppState>) -> Result<Json<Vec<AssignmentRow>>, ApiError> {
    let rows = sqlx::query_as::<_, AssignmentRow>("SELECT public_id, title FROM assignments ORDER BY created_at ASC")
        .fetch_all(&state.pool)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct CreateSubmissionRequest {
    candidate_id: String,
    assignment_id: String,
}

async fn create_submission(
    State(state): State<AppState>,
    Json(body): Json<CreateSubmissionRequest>,
) -> Result<Json<PublicIdResponse>, ApiError> {
    insert_submission(&state, &body.candidate_id, &body.assignment_id, Status::Uploaded, None).await
}

#[derive(Deserialize)]
struct CreateSubmissionFromFileRequest {
    candidate_id: String,
    assignment_id: String,
    bucket: String,
    object_key: String,
    schema_version: i32,
}

async fn create_submission_from_file(
    State(state): State<AppState>,
    Json(body): Json<CreateSubmissionFromFileRequest>,
) -> Result<Json<PublicIdResponse>, ApiError> {
    let artifact = Some((body.bucket, body.object_key, body.schema_version));
    insert_submission(&state, &body.candidate_id, &body.assignment_id, Status::Uploaded, artifact).await
}

async fn insert_submission(
    state: &AppState,
    candidate_id: &str,
    assignment_id: &str,
    status: Status,
    raw_artifact: Option<(String, String, i32)>,
) -> Result<Json<PublicIdResponse>, ApiError> {
    let public_id = PublicId::generate("sub");
    sqlx::query("INSERT INTO submissions (public_id, candidate_id, assignment_id, status) VALUES ($1, $2, $3, $4)")
        .bind(public_id.as_str())
        .bind(candidate_id)
        .bind(assignment_id)
        .bind(status.as_str())
        .execute(&state.pool)
        .await
        .map_err(ApiError::from)?;

    if let Some((bucket, object_key, schema_version)) = raw_artifact {
        state
            .repository
            .link_artifact(&public_id, scheduler_core::Stage::TelegramIngest, &bucket, &object_key, schema_version)
            .await
            .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    }

    Ok(Json(PublicIdResponse {
        public_id: public_id.to_string(),
    }))
}

#[derive(Deserialize)]
struct TelegramWebhookRequest {
    update_id: String,
    candidate_id: String,
    assignment_id: String,
}

async fn telegram_webhook(
    State(state): State<AppState>,
    Json(body): Json<TelegramWebhookRequest>,
) -> Result<Json<PublicIdResponse>, ApiError> {
    // Two concurrent POSTs with the same update_id must resolve to the same submission (§8
    // property 7 / scenario 6). A plain check-then-insert races: both requests can see no row
    // under read-committed and both proceed to insert. Instead, speculatively create a
    // submission, then let the UNIQUE(source_type, source_external_id) constraint on
    // submission_sources pick exactly one winner via ON CONFLICT DO NOTHING; the loser discards
    // its own speculative submission row before the transaction that created it ever commits.
    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;

    let candidate_public_id = PublicId::generate("sub");
    sqlx::query("INSERT INTO submissions (public_id, candidate_id, assignment_id, status) VALUES ($1, $2, $3, $4)")
        .bind(candidate_public_id.as_str())
        .bind(&body.candidate_id)
        .bind(&body.assignment_id)
        .bind(Status::TelegramUpdateReceived.as_str())
        .execute(&mut *tx)
        .await
        .map_err(ApiError::from)?;

    let won = sqlx::query_as::<_, (String,)>(
        r#"
        INSERT INTO submission_sources (submission_public_id, source_type, source_external_id)
        VALUES ($1, 'telegram_webhook', $2)
        ON CONFLICT (source_type, source_external_id) DO NOTHING
        RETURNING submission_public_id
        "#,
    )
    .bind(candidate_public_id.as_str())
    .bind(&body.update_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::from)?;

    let public_id = match won {
        Some(row) => row.0,
        None => {
            sqlx::query("DELETE FROM submissions WHERE public_id = $1")
                .bind(candidate_public_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(ApiError::from)?;

            let (existing,): (String,) = sqlx::query_as(
                "SELECT submission_public_id FROM submission_sources WHERE source_type = 'telegram_webhook' AND source_external_id = $1",
            )
            .bind(&body.update_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(ApiError::from)?;
            existing
        }
    };

    tx.commit().await.map_err(ApiError::from)?;

    Ok(Json(PublicIdResponse { public_id }))
}

#[derive(Serialize)]
struct SubmissionView {
    public_id: String,
    status: String,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    artifacts: Vec<ArtifactView>,
}

#[derive(Serialize)]
struct ArtifactView {
    stage: String,
    bucket: String,
    object_key: String,
    schema_version: i32,
}

async fn get_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubmissionView>, ApiError> {
    let public_id = PublicId::from_raw(id);
    let snapshot = state
        .repository
        .get_status(&public_id)
        .await
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("submission {public_id} not found")))?;

    let artifacts = state
        .repository
        .list_artifacts(&public_id)
        .await
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(Json(SubmissionView {
        public_id: public_id.to_string(),
        status: snapshot.status.as_str().to_string(),
        last_error_code: snapshot.last_error_code,
        last_error_message: snapshot.last_error_message,
        artifacts: artifacts
            .into_iter()
            .map(|artifact| ArtifactView {
                stage: artifact.stage.as_str().to_string(),
                bucket: artifact.bucket,
                object_key: artifact.object_key,
                schema_version: artifact.schema_version,
            })
            .collect(),
    }))
}

#[derive(Serialize, sqlx::FromRow)]
struct FeedbackRow {
    submission_public_id: String,
    score: Option<f64>,
}

async fn list_feedback(State(state): State<AppState>) -> Result<Json<Vec<FeedbackRow>>, ApiError> {
    let rows = sqlx::query_as::<_, FeedbackRow>(
        "SELECT submission_public_id, score FROM evaluations ORDER BY created_at DESC LIMIT 100",
    )
    .fetch_all(&state.pool)
    .await
    .map_err(ApiError::from)?;
    Ok(Json(rows))
}

#[derive(Serialize)]
struct ExportResponse {
    export_id: String,
}

/// Exports are a reporting concern the scheduler's Store doesn't model; this stub mints an id so
/// ingress callers have a stable contract to poll, without a real export pipeline behind it.
async fn create_export(State(_state): State<AppState>) -> Json<ExportResponse> {
    Json(ExportResponse {
        export_id: PublicId::generate("export").to_string(),
    })
}

async fn download_export(Path(_id): Path<String>) -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "export generation is outside this service's scope")
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ReadyResponse {
    database_ok: bool,
    metrics: Option<RunnerMetricsSnapshot>,
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let database_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    Json(ReadyResponse {
        database_ok,
        metrics: None,
    })
}

struct ApiError(StatusCode, String);

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, self.1).into_response()
    }
}
