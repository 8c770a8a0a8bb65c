//! Example `normalize` stage handler.
//!
//! Shows using `reqwest` directly in a [`StageHandler`] — no adapter, no ceremony: fetch the raw
//! upload referenced by the `telegram_ingest` artifact and persist it as the normalized artifact.
//!
//! This binary seeds one uploaded submission and runs a single worker tick against it; it is a
//! demonstration of the handler contract, not the production entrypoint (see `submission-service`
//! for that).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scheduler_core::{
    ArtifactRef, Claim, ClaimRepository, ErrorKind, ProcessResult, Stage, StageHandler, Status,
    WorkerLoop, WorkerLoopConfig,
};
use scheduler_testing::InMemoryClaimRepository;
use tokio_util::sync::CancellationToken;

struct Deps {
    repository: Arc<dyn ClaimRepository>,
    http_client: reqwest::Client,
    artifact_root: PathBuf,
}

struct NormalizeHandler;

#[async_trait]
impl StageHandler<Deps> for NormalizeHandler {
    async fn process(&self, claim: &Claim, deps: &Deps, cancel: &CancellationToken) -> ProcessResult {
        let raw_ref = match deps
            .repository
            .get_artifact_ref(&claim.public_id, Stage::TelegramIngest)
            .await
        {
            Ok(Some(artifact_ref)) => artifact_ref,
            Ok(None) => {
                return ProcessResult::failure(ErrorKind::PermanentBadInput, "no raw upload to normalize")
            }
            Err(err) => return ProcessResult::failure(ErrorKind::RetryableResource, err.to_string()),
        };

        if raw_ref.schema_version != 1 {
            return ProcessResult::failure(
                ErrorKind::PermanentBadInput,
                format!("unsupported raw upload schema version {}", raw_ref.schema_version),
            );
        }

        if cancel.is_cancelled() {
            return ProcessResult::cancelled("lease lost before fetch");
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return ProcessResult::cancelled("lease lost during fetch"),
            result = deps.http_client.get(&raw_ref.object_key).send() => result,
        };

        let content = match fetched {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(err) => return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string()),
            },
            Ok(response) => {
                return ProcessResult::failure(
                    ErrorKind::RetryableTransient,
                    format!("upstream returned HTTP {}", response.status()),
                )
            }
            Err(err) => return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string()),
        };

        let object_key = format!("{}/normalize.json", claim.public_id);
        let body = format!("{{\"text\": {}}}", serde_json_escape(&content));

        if let Some(parent) = deps.artifact_root.join(&object_key).parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string());
            }
        }
        if let Err(err) = tokio::fs::write(deps.artifact_root.join(&object_key), body).await {
            return ProcessResult::failure(ErrorKind::RetryableTransient, err.to_string());
        }

        ProcessResult::success_with_artifact(ArtifactRef {
            bucket: "local".to_string(),
            object_key,
            schema_version: 1,
        })
    }
}

/// Minimal JSON string escaping so this demo doesn't need to pull in `serde_json` just to quote
/// one field.
fn serde_json_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for ch in raw.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let artifact_root = std::env::var("ARTIFACT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./demo-artifacts"));

    let repository = Arc::new(InMemoryClaimRepository::new());
    let public_id = repository.seed(Status::Uploaded);
    repository
        .link_artifact(
            &public_id,
            Stage::TelegramIngest,
            "remote",
            "https://example.com",
            1,
        )
        .await?;

    let deps = Deps {
        repository: repository.clone(),
        http_client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
        artifact_root,
    };

    let worker_loop = WorkerLoop::new(
        repository.clone(),
        NormalizeHandler,
        deps,
        WorkerLoopConfig {
            stage: Stage::Normalize,
            worker_id: "demo-worker".to_string(),
            lease_seconds: 30,
            heartbeat_interval_ms: 5_000,
            max_attempts: 3,
            reclaim_batch_limit: 100,
        },
    );

    println!("Normalizing submission {public_id}...");
    worker_loop.run_once().await?;

    let snapshot = repository.get_status(&public_id).await?.unwrap();
    println!("Final status: {}", snapshot.status);

    Ok(())
}
