//! Example `evaluate` stage handler.
//!
//! Shows how to call an LLM directly from a [`StageHandler`] — no adapter, just `reqwest` and
//! `serde`, reading the normalized artifact and writing the evaluation result as a new one.
//!
//! This binary seeds one normalized submission and runs a single worker tick against it; it is a
//! demonstration of the handler contract, not the production entrypoint (see `submission-service`
//! for that).

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scheduler_core::{
    ArtifactRef, Claim, ClaimRepository, ErrorKind, ProcessResult, Stage, StageHandler, Status,
    WorkerLoop, WorkerLoopConfig,
};
use scheduler_testing::InMemoryClaimRepository;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

struct Deps {
    repository: Arc<dyn ClaimRepository>,
    http_client: reqwest::Client,
    api_key: String,
    artifact_root: PathBuf,
}

struct EvaluateHandler;

#[async_trait]
impl StageHandler<Deps> for EvaluateHandler {
    async fn process(&self, claim: &Claim, deps: &Deps, cancel: &CancellationToken) -> ProcessResult {
        let normalized_ref = match deps
            .repository
            .get_artifact_ref(&claim.public_id, Stage::Normalize)
            .await
        {
            Ok(Some(artifact_ref)) => artifact_ref,
            Ok(None) => {
                return ProcessResult::failure(
                    ErrorKind::PermanentBadInput,
                    "no normalized artifact to evaluate",
                )
            }
            Err(err) => return ProcessResult::failure(ErrorKind::RetryableResource, err.to_string()),
        };

        let normalized_text = match tokio::fs::read_to_string(
            deps.artifact_root.join(&normalized_ref.object_key),
        )
        .await
        {
            Ok(text) => text,
            Err(err) => {
                return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string())
            }
        };

        let request = AnthropicRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 1024,
            messages: vec![Message {
                role: "user".to_string(),
                content: format!(
                    "Evaluate the following submission. Respond with JSON only: \
                     {{\"score\": <0-1 float>, \"feedback\": \"<one paragraph>\"}}.\n\n{normalized_text}"
                ),
            }],
        };

        if cancel.is_cancelled() {
            return ProcessResult::cancelled("lease lost before model call");
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return ProcessResult::cancelled("lease lost during model call"),
            result = call_anthropic(&deps.http_client, &deps.api_key, request) => result,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string()),
        };

        let text = response
            .content
            .first()
            .and_then(|block| block.text.clone())
            .unwrap_or_default();

        let evaluation: Evaluation = match serde_json::from_str(&text) {
            Ok(evaluation) => evaluation,
            Err(err) => {
                return ProcessResult::failure(
                    ErrorKind::PermanentBadInput,
                    format!("model response was not the expected JSON shape: {err}"),
                )
            }
        };

        let object_key = format!("{}/evaluate.json", claim.public_id);
        let payload = match serde_json::to_vec_pretty(&evaluation) {
            Ok(payload) => payload,
            Err(err) => return ProcessResult::failure(ErrorKind::FatalInfrastructure, err.to_string()),
        };

        if let Some(parent) = deps.artifact_root.join(&object_key).parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string());
            }
        }
        if let Err(err) = tokio::fs::write(deps.artifact_root.join(&object_key), payload).await {
            return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string());
        }

        ProcessResult::success_with_artifact(ArtifactRef {
            bucket: "local".to_string(),
            object_key,
            schema_version: 1,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Evaluation {
    score: f64,
    feedback: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    block_type: String,
    text: Option<String>,
}

async fn call_anthropic(
    client: &reqwest::Client,
    api_key: &str,
    request: AnthropicRequest,
) -> Result<AnthropicResponse> {
    let response = client
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await?;
        bail!("API error {status}: {body}");
    }

    Ok(response.json().await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let api_key =
        env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY environment variable required")?;
    let artifact_root = env::var("ARTIFACT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./demo-artifacts"));

    let repository = Arc::new(InMemoryClaimRepository::new());
    let public_id = repository.seed(Status::Normalized);

    let object_key = format!("{public_id}/normalize.json");
    tokio::fs::create_dir_all(artifact_root.join(public_id.as_str())).await?;
    tokio::fs::write(
        artifact_root.join(&object_key),
        br#"{"text": "A short essay about borrow checking."}"#,
    )
    .await?;
    repository
        .link_artifact(&public_id, Stage::Normalize, "local", &object_key, 1)
        .await?;

    let deps = Deps {
        repository: repository.clone(),
        http_client: reqwest::Client::new(),
        api_key,
        artifact_root,
    };

    let worker_loop = WorkerLoop::new(
        repository.clone(),
        EvaluateHandler,
        deps,
        WorkerLoopConfig {
            stage: Stage::Evaluate,
            worker_id: "demo-worker".to_string(),
            lease_seconds: 30,
            heartbeat_interval_ms: 5_000,
            max_attempts: 3,
            reclaim_batch_limit: 100,
        },
    );

    println!("Evaluating submission {public_id}...");
    worker_loop.run_once().await?;

    let snapshot = repository.get_status(&public_id).await?.unwrap();
    println!("Final status: {}", snapshot.status);

    Ok(())
}
