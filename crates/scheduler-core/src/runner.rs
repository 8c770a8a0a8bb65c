//! The long-lived driver (§4.5): repeatedly ticks a [`WorkerLoop`] and sleeps according to what
//! the tick did.
//!
//! Metrics counters are the only process-wide mutable state in this crate; they are plain
//! atomics, read by the `/ready` HTTP handler in the service binary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::handler::{HandlerDeps, StageHandler};
use crate::worker_loop::WorkerLoop;

/// Sleep durations the [`Runner`] applies after each tick, keyed by what happened.
#[derive(Debug, Clone, Copy)]
pub struct RunnerTimings {
    pub poll_interval: Duration,
    pub idle_backoff: Duration,
    pub error_backoff: Duration,
}

/// Process-wide counters and readiness bits, safe to share across tasks without locking.
#[derive(Default)]
pub struct RunnerMetrics {
    pub ticks_total: AtomicU64,
    pub claims_total: AtomicU64,
    pub idle_ticks_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub worker_loop_enabled: AtomicBool,
    pub worker_loop_ready: AtomicBool,
}

impl RunnerMetrics {
    pub fn snapshot(&self) -> RunnerMetricsSnapshot {
        RunnerMetricsSnapshot {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            claims_total: self.claims_total.load(Ordering::Relaxed),
            idle_ticks_total: self.idle_ticks_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            worker_loop_enabled: self.worker_loop_enabled.load(Ordering::Relaxed),
            worker_loop_ready: self.worker_loop_ready.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read of [`RunnerMetrics`], suitable for serializing into a `/ready` response.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunnerMetricsSnapshot {
    pub ticks_total: u64,
    pub claims_total: u64,
    pub idle_ticks_total: u64,
    pub errors_total: u64,
    pub worker_loop_enabled: bool,
    pub worker_loop_ready: bool,
}

/// Drives a [`WorkerLoop`] on a cadence until cancelled.
pub struct Runner<D: HandlerDeps, H: StageHandler<D>> {
    worker_loop: WorkerLoop<D, H>,
    timings: RunnerTimings,
    metrics: Arc<RunnerMetrics>,
}

impl<D: HandlerDeps, H: StageHandler<D>> Runner<D, H> {
    pub fn new(worker_loop: WorkerLoop<D, H>, timings: RunnerTimings) -> Self {
        let metrics = Arc::new(RunnerMetrics::default());
        metrics.worker_loop_enabled.store(true, Ordering::Relaxed);
        Self {
            worker_loop,
            timings,
            metrics,
        }
    }

    /// A shared handle to this runner's counters, for wiring into a readiness endpoint.
    pub fn metrics(&self) -> Arc<RunnerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until `shutdown` is cancelled, applying the appropriate backoff after each tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.metrics.worker_loop_ready.store(true, Ordering::Relaxed);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.metrics.ticks_total.fetch_add(1, Ordering::Relaxed);

            let sleep_for = match self.worker_loop.run_once().await {
                Ok(outcome) if outcome.did_work => {
                    self.metrics.claims_total.fetch_add(1, Ordering::Relaxed);
                    self.timings.poll_interval
                }
                Ok(_) => {
                    self.metrics.idle_ticks_total.fetch_add(1, Ordering::Relaxed);
                    self.timings.idle_backoff
                }
                Err(err) => {
                    self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    error!(error = %err, "worker loop tick failed");
                    self.timings.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        self.metrics.worker_loop_ready.store(false, Ordering::Relaxed);
        info!("runner shut down");
    }
}
