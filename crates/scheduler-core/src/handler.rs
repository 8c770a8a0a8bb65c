//! The stage handler contract (§4.4): a pure function from a [`Claim`] to a [`ProcessResult`].
//!
//! Handlers own no scheduling state. They are stateless and must be idempotent with respect to
//! `public_id` — the worker loop may re-invoke them after a crash reclaims the same submission.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{ArtifactRef, Claim, ErrorKind};

/// The outcome of one stage-handler invocation.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    pub artifact_ref: Option<ArtifactRef>,
}

impl ProcessResult {
    /// A successful result with no new artifact (e.g. the stage only mutated existing rows).
    pub fn success() -> Self {
        Self {
            success: true,
            error_kind: None,
            detail: None,
            artifact_ref: None,
        }
    }

    /// A successful result that also produced a new artifact, to be linked before finalize.
    pub fn success_with_artifact(artifact_ref: ArtifactRef) -> Self {
        Self {
            success: true,
            error_kind: None,
            detail: None,
            artifact_ref: Some(artifact_ref),
        }
    }

    /// A failed result, classified per the taxonomy in §7.
    pub fn failure(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            detail: Some(detail.into()),
            artifact_ref: None,
        }
    }

    /// A cancellation, reported the same way a failure is but always classified `Cancelled`.
    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::failure(ErrorKind::Cancelled, detail)
    }
}

/// Dependencies a stage handler needs: store readers, artifact storage, model clients, etc. Kept
/// deliberately opaque here — concrete handler implementations define their own `Deps` type and
/// are generic only over it, not over the scheduler.
///
/// This trait has no methods; it exists so [`StageHandler`] can require `Send + Sync` on
/// whatever a handler's dependency bundle turns out to be without the core crate knowing its
/// shape.
pub trait HandlerDeps: Send + Sync {}

impl<T: Send + Sync> HandlerDeps for T {}

/// A pure, idempotent, stage-specific unit of work.
///
/// # Idempotence
///
/// Re-execution after a crash must reproduce the same observable state: prefer upserts,
/// content-addressed object keys, or `ON CONFLICT DO NOTHING` inserts over "check then write."
///
/// # Determinism
///
/// Where feasible, record `seed`, `temperature`, `chain_version`, and `prompt_version` alongside
/// any model-derived output so runs are reproducible for audit.
#[async_trait]
pub trait StageHandler<D: HandlerDeps>: Send + Sync {
    /// Run this stage for `claim`, cooperatively honoring `cancel`.
    ///
    /// Implementations MUST poll `cancel.is_cancelled()` (or race it via
    /// `cancel.cancelled()`) at I/O suspension points and return
    /// [`ProcessResult::cancelled`] promptly once it fires — the worker loop has already decided
    /// the lease is gone and will not use a late success.
    async fn process(&self, claim: &Claim, deps: &D, cancel: &CancellationToken) -> ProcessResult;
}
