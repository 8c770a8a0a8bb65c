//! The per-tick orchestrator (§4.3): reclaim → claim → heartbeat + handle → link → finalize.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::handler::{HandlerDeps, StageHandler};
use crate::model::{ErrorKind, Stage};
use crate::repository::ClaimRepository;

/// Error code recorded against a submission reclaimed after its lease expired.
const LEASE_EXPIRED_ERROR_CODE: &str = "lease_expired";
const LEASE_EXPIRED_ERROR_MESSAGE: &str = "lease expired before the handler completed";

/// Everything [`WorkerLoop::run_once`] needs that isn't the repository, handler, or deps.
#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    pub stage: Stage,
    pub worker_id: String,
    pub lease_seconds: i64,
    pub heartbeat_interval_ms: u64,
    pub max_attempts: i32,
    pub reclaim_batch_limit: i64,
}

impl WorkerLoopConfig {
    /// Panics if the heartbeat cadence could let one missed beat trigger a reclaim (§5).
    pub fn validate(&self) {
        let lease_ms = self.lease_seconds.max(0) as u64 * 1000;
        assert!(
            3 * self.heartbeat_interval_ms < lease_ms,
            "heartbeat_interval_ms ({}) too close to lease_seconds ({}s): \
             3 * heartbeat_interval_ms must be < lease_seconds * 1000",
            self.heartbeat_interval_ms,
            self.lease_seconds
        );
    }
}

/// What happened during one [`WorkerLoop::run_once`] tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    pub did_work: bool,
    pub reclaimed_retry: usize,
    pub reclaimed_dead_letter: usize,
}

/// The per-tick orchestrator for a single stage.
///
/// One `WorkerLoop` is bound to one [`Stage`]; a process hosting multiple stages runs multiple
/// loops (each under its own [`crate::runner::Runner`]).
pub struct WorkerLoop<D: HandlerDeps, H: StageHandler<D>> {
    repository: Arc<dyn ClaimRepository>,
    handler: H,
    deps: D,
    config: WorkerLoopConfig,
}

impl<D: HandlerDeps, H: StageHandler<D>> WorkerLoop<D, H> {
    pub fn new(
        repository: Arc<dyn ClaimRepository>,
        handler: H,
        deps: D,
        config: WorkerLoopConfig,
    ) -> Self {
        config.validate();
        Self {
            repository,
            handler,
            deps,
            config,
        }
    }

    /// Run one tick to completion. See the module doc and §4.3 for the step-by-step contract.
    pub async fn run_once(&self) -> Result<TickOutcome> {
        let descriptor = self.config.stage.descriptor();

        let reclaimed_retry = self
            .repository
            .reclaim_expired_retry(
                descriptor.in_progress,
                descriptor.failure,
                LEASE_EXPIRED_ERROR_CODE,
                LEASE_EXPIRED_ERROR_MESSAGE,
                self.config.max_attempts,
                self.config.stage,
                self.config.reclaim_batch_limit,
            )
            .await?;
        let reclaimed_dead_letter = self
            .repository
            .reclaim_expired_dead_letter(
                descriptor.in_progress,
                LEASE_EXPIRED_ERROR_CODE,
                LEASE_EXPIRED_ERROR_MESSAGE,
                self.config.max_attempts,
                self.config.stage,
                self.config.reclaim_batch_limit,
            )
            .await?;

        if !reclaimed_retry.is_empty() || !reclaimed_dead_letter.is_empty() {
            warn!(
                stage = %self.config.stage,
                retried = reclaimed_retry.len(),
                dead_lettered = reclaimed_dead_letter.len(),
                "reclaimed expired claims"
            );
        }

        let claim = match self
            .repository
            .claim_next(
                descriptor.pre,
                descriptor.in_progress,
                &self.config.worker_id,
                self.config.lease_seconds,
                self.config.stage,
            )
            .await?
        {
            Some(claim) => claim,
            None => {
                return Ok(TickOutcome {
                    did_work: false,
                    reclaimed_retry: reclaimed_retry.len(),
                    reclaimed_dead_letter: reclaimed_dead_letter.len(),
                })
            }
        };

        debug!(
            stage = %self.config.stage,
            public_id = %claim.public_id,
            worker_id = %self.config.worker_id,
            attempt = claim.attempt,
            "claimed submission"
        );

        let cancel = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat_task = tokio::spawn(run_heartbeat(
            Arc::clone(&self.repository),
            claim.public_id.clone().to_string(),
            descriptor.in_progress,
            self.config.worker_id.clone(),
            self.config.lease_seconds,
            self.config.heartbeat_interval_ms,
            cancel.clone(),
            stop_heartbeat.clone(),
        ));

        let result = self.handler.process(&claim, &self.deps, &cancel).await;

        stop_heartbeat.cancel();
        let _ = heartbeat_task.await;

        // `permanent_business` is §7's success path in disguise: the handler reports failure
        // bookkeeping-wise, but a negative business result is itself the successful outcome.
        let is_success = result.success || result.error_kind == Some(ErrorKind::PermanentBusiness);

        if is_success {
            if let Some(artifact_ref) = &result.artifact_ref {
                self.repository
                    .link_artifact(
                        &claim.public_id,
                        self.config.stage,
                        &artifact_ref.bucket,
                        &artifact_ref.object_key,
                        artifact_ref.schema_version,
                    )
                    .await?;
            }

            let finalized = self
                .repository
                .finalize_success(
                    &claim.public_id,
                    descriptor.in_progress,
                    &self.config.worker_id,
                    descriptor.success,
                )
                .await?;

            if !finalized {
                warn!(
                    stage = %self.config.stage,
                    public_id = %claim.public_id,
                    "finalize_success_rejected: lease was lost before finalize"
                );
            } else {
                info!(
                    stage = %self.config.stage,
                    public_id = %claim.public_id,
                    "stage succeeded"
                );
            }
        } else {
            let kind = result.error_kind.unwrap_or(ErrorKind::FatalInfrastructure);
            let message = result.detail.unwrap_or_else(|| kind.to_string());

            if kind.is_retryable() {
                let retried = self
                    .repository
                    .finalize_failure_retry(
                        &claim.public_id,
                        descriptor.in_progress,
                        &self.config.worker_id,
                        descriptor.failure,
                        kind.as_str(),
                        &message,
                        self.config.max_attempts,
                        self.config.stage,
                    )
                    .await?;

                if !retried {
                    let terminal = self
                        .repository
                        .finalize_failure_terminal(
                            &claim.public_id,
                            descriptor.in_progress,
                            &self.config.worker_id,
                            kind.as_str(),
                            &message,
                        )
                        .await?;

                    if !terminal {
                        warn!(
                            stage = %self.config.stage,
                            public_id = %claim.public_id,
                            "finalize_failure_rejected: lease was lost before finalize"
                        );
                    } else {
                        warn!(
                            stage = %self.config.stage,
                            public_id = %claim.public_id,
                            error_kind = kind.as_str(),
                            "attempts exhausted, moved to dead_letter"
                        );
                    }
                } else {
                    debug!(
                        stage = %self.config.stage,
                        public_id = %claim.public_id,
                        error_kind = kind.as_str(),
                        "stage failed, retry scheduled"
                    );
                }
            } else {
                // `permanent_bad_input` (and any other non-retryable kind): a single attempt is
                // terminal by policy, so go straight to dead_letter without touching the attempt
                // counter (§4.1's finalize_failure_terminal contract).
                let terminal = self
                    .repository
                    .finalize_failure_terminal(
                        &claim.public_id,
                        descriptor.in_progress,
                        &self.config.worker_id,
                        kind.as_str(),
                        &message,
                    )
                    .await?;

                if !terminal {
                    warn!(
                        stage = %self.config.stage,
                        public_id = %claim.public_id,
                        "finalize_failure_rejected: lease was lost before finalize"
                    );
                } else {
                    warn!(
                        stage = %self.config.stage,
                        public_id = %claim.public_id,
                        error_kind = kind.as_str(),
                        "non-retryable failure, moved directly to dead_letter"
                    );
                }
            }
        }

        Ok(TickOutcome {
            did_work: true,
            reclaimed_retry: reclaimed_retry.len(),
            reclaimed_dead_letter: reclaimed_dead_letter.len(),
        })
    }
}

/// Background task: heartbeat on a cadence until told to stop, or until a heartbeat is rejected
/// (lease lost), in which case it cancels `cancel` and stops.
#[allow(clippy::too_many_arguments)]
async fn run_heartbeat(
    repository: Arc<dyn ClaimRepository>,
    public_id_raw: String,
    in_progress_status: crate::model::Status,
    worker_id: String,
    lease_seconds: i64,
    heartbeat_interval_ms: u64,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let public_id = crate::model::PublicId::from_raw(public_id_raw);
    let interval = Duration::from_millis(heartbeat_interval_ms);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match repository
            .heartbeat_claim(&public_id, in_progress_status, &worker_id, lease_seconds)
            .await
        {
            Ok(true) => continue,
            Ok(false) => {
                warn!(public_id = %public_id, worker_id = %worker_id, "lease_lost: heartbeat rejected");
                cancel.cancel();
                return;
            }
            Err(err) => {
                warn!(public_id = %public_id, error = %err, "heartbeat call failed; leaving lease as-is");
            }
        }
    }
}
