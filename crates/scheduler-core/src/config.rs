//! Scheduler-side configuration loaded from environment variables (§6, §10.3).
//!
//! Callers typically invoke [`dotenvy::dotenv`] once at process startup (in the binary, not
//! here) before calling [`SchedulerConfig::from_env`], so a local `.env` file can supply these
//! during development.

use std::env;

use anyhow::{Context, Result};

/// Timing and retry policy for one stage's [`crate::worker_loop::WorkerLoop`] /
/// [`crate::runner::Runner`] pair.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub idle_backoff_ms: u64,
    pub error_backoff_ms: u64,
    pub claim_lease_seconds: i64,
    pub heartbeat_interval_ms: u64,
    pub max_attempts: i32,
    pub reclaim_batch_limit: i64,
    pub artifact_compat_policy: ArtifactCompatPolicy,
}

/// How strictly a stage handler enforces the artifact schema version it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactCompatPolicy {
    /// A schema-version mismatch is `permanent_bad_input` (§7): immediate dead-letter.
    Strict,
    /// A schema-version mismatch is tolerated on a best-effort basis.
    Lenient,
}

impl SchedulerConfig {
    /// Load from environment variables, applying the defaults in §6's configuration table.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            poll_interval_ms: env_u64("WORKER_POLL_INTERVAL_MS", 200)?,
            idle_backoff_ms: env_u64("WORKER_IDLE_BACKOFF_MS", 1000)?,
            error_backoff_ms: env_u64("WORKER_ERROR_BACKOFF_MS", 2000)?,
            claim_lease_seconds: env_i64("WORKER_CLAIM_LEASE_SECONDS", 30)?,
            heartbeat_interval_ms: env_u64("WORKER_HEARTBEAT_INTERVAL_MS", 10_000)?,
            max_attempts: env_i32("WORKER_MAX_ATTEMPTS", 3)?,
            reclaim_batch_limit: env_i64("WORKER_RECLAIM_BATCH_LIMIT", 100)?,
            artifact_compat_policy: match env::var("ARTIFACT_COMPAT_POLICY") {
                Ok(value) if value.eq_ignore_ascii_case("lenient") => ArtifactCompatPolicy::Lenient,
                Ok(value) if value.eq_ignore_ascii_case("strict") => ArtifactCompatPolicy::Strict,
                Ok(other) => {
                    anyhow::bail!("ARTIFACT_COMPAT_POLICY must be 'strict' or 'lenient', got {other}")
                }
                Err(_) => ArtifactCompatPolicy::Strict,
            },
        })
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("{key} must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("{key} must be an integer")),
        Err(_) => Ok(default),
    }
}

fn env_i32(key: &str, default: i32) -> Result<i32> {
    match env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("{key} must be an integer")),
        Err(_) => Ok(default),
    }
}
