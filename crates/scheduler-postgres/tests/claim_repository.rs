//! Integration tests against a live Postgres instance.
//!
//! Ignored by default — they require a reachable database and run migrations against it.
//!
//! Run:
//!   DATABASE_URL=postgres://... cargo test -p scheduler-postgres --test claim_repository -- --ignored

use std::sync::Arc;

use scheduler_core::{ClaimRepository, PublicId, Stage, Status};
use scheduler_postgres::PgClaimRepository;
use sqlx::PgPool;

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set to run scheduler-postgres integration tests");
    let pool = PgPool::connect(&url).await.expect("connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

async fn seed_submission(pool: &PgPool, status: Status) -> PublicId {
    let public_id = PublicId::generate("sub");
    sqlx::query(
        "INSERT INTO submissions (public_id, candidate_id, assignment_id, status) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(public_id.as_str())
    .bind(PublicId::generate("cand").as_str())
    .bind(PublicId::generate("asg").as_str())
    .bind(status.as_str())
    .execute(pool)
    .await
    .expect("seed submission");
    public_id
}

#[tokio::test]
#[ignore]
async fn claim_next_is_contention_free_under_many_concurrent_workers() {
    let pool = test_pool().await;
    let repo = Arc::new(PgClaimRepository::new(pool.clone()));
    let public_id = seed_submission(&pool, Status::Normalized).await;

    let mut handles = Vec::new();
    for n in 0..16 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.claim_next(
                Status::Normalized,
                Status::EvaluationInProgress,
                &format!("worker-{n}"),
                30,
                Stage::Evaluate,
            )
            .await
            .expect("claim_next")
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        if handle.await.expect("task").is_some() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 1, "exactly one worker should win FOR UPDATE SKIP LOCKED");

    let snapshot = repo.get_status(&public_id).await.expect("get_status").expect("row exists");
    assert_eq!(snapshot.status, Status::EvaluationInProgress);
    assert!(snapshot.claimed_by.is_some());
    assert!(snapshot.lease_expires_at.is_some());
}

#[tokio::test]
#[ignore]
async fn heartbeat_fails_once_lease_is_lost_to_a_reclaim() {
    let pool = test_pool().await;
    let repo = PgClaimRepository::new(pool);
    let public_id = seed_submission(&repo.pool().clone(), Status::Normalized).await;

    let claim = repo
        .claim_next(
            Status::Normalized,
            Status::EvaluationInProgress,
            "worker-a",
            30,
            Stage::Evaluate,
        )
        .await
        .expect("claim_next")
        .expect("row was ready");

    // A different worker id can never heartbeat a lease it doesn't own.
    let stolen = repo
        .heartbeat_claim(&public_id, Status::EvaluationInProgress, "worker-b", 30)
        .await
        .expect("heartbeat_claim");
    assert!(!stolen, "heartbeat must be gated on the owning worker_id");

    let ok = repo
        .heartbeat_claim(&claim.public_id, Status::EvaluationInProgress, "worker-a", 30)
        .await
        .expect("heartbeat_claim");
    assert!(ok, "the owning worker's heartbeat must succeed");
}

#[tokio::test]
#[ignore]
async fn reclaim_batch_limit_caps_rows_moved_and_partitions_retry_from_dead_letter() {
    let pool = test_pool().await;
    let repo = PgClaimRepository::new(pool.clone());

    let mut expired_with_budget = Vec::new();
    for _ in 0..3 {
        let public_id = seed_submission(&pool, Status::Normalized).await;
        repo.claim_next(
            Status::Normalized,
            Status::EvaluationInProgress,
            "dead-worker",
            -1,
            Stage::Evaluate,
        )
        .await
        .expect("claim_next");
        expired_with_budget.push(public_id);
    }

    let exhausted = seed_submission(&pool, Status::Normalized).await;
    repo.claim_next(
        Status::Normalized,
        Status::EvaluationInProgress,
        "dead-worker",
        -1,
        Stage::Evaluate,
    )
    .await
    .expect("claim_next");
    sqlx::query("UPDATE submissions SET attempt_evaluation = 2 WHERE public_id = $1")
        .bind(exhausted.as_str())
        .execute(&pool)
        .await
        .expect("bump attempt counter past budget");

    let retried = repo
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
        .expect("reclaim_expired_retry");
    assert_eq!(retried.len(), 2, "batch_limit caps rows moved in one call");

    let dead_lettered = repo
        .reclaim_expired_dead_letter(
            Status::EvaluationInProgress,
            "lease_expired",
            "worker heartbeat stopped",
            3,
            Stage::Evaluate,
            100,
        )
        .await
        .expect("reclaim_expired_dead_letter");
    assert_eq!(dead_lettered, vec![exhausted.clone()]);

    let snapshot = repo.get_status(&exhausted).await.expect("get_status").expect("row exists");
    assert_eq!(snapshot.status, Status::DeadLetter);
}
