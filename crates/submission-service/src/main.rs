//! `submission-service`: the thin HTTP ingress and worker-role bootstrap described in §11.
//!
//! One binary, five roles (`--role`): `api` serves the HTTP ingress surface; the four
//! `worker-*` roles each drive one [`Runner`] bound to one stage's [`WorkerLoop`]. Per-stage
//! business logic is supplied by the handlers in [`handlers`] — stand-ins here, see `demos/` for
//! examples wired to real clients.

mod config;
mod handlers;
mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use scheduler_core::{Runner, RunnerTimings, Stage, WorkerLoop, WorkerLoopConfig};
use scheduler_postgres::PgClaimRepository;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::ServiceConfig;
use handlers::{DeliverHandler, EvaluateHandler, NormalizeHandler, ServiceDeps, TelegramIngestHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Api,
    WorkerIngestTelegram,
    WorkerNormalize,
    WorkerEvaluate,
    WorkerDeliver,
}

#[derive(Debug, Parser)]
#[command(name = "submission-service")]
struct Cli {
    #[arg(long, value_enum)]
    role: Role,

    /// Validate configuration and wiring, then exit zero without serving or polling.
    #[arg(long)]
    dry_run_startup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,submission_service=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env().context("failed to load configuration")?;

    tracing::info!(role = ?cli.role, "starting submission-service");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("../scheduler-postgres/migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let repository: Arc<dyn scheduler_core::ClaimRepository> =
        Arc::new(PgClaimRepository::new(pool.clone()));

    if cli.dry_run_startup {
        tracing::info!("dry-run-startup: wiring validated, exiting");
        return Ok(());
    }

    match cli.role {
        Role::Api => run_api(config, pool, repository).await,
        Role::WorkerIngestTelegram => {
            run_worker(
                config,
                pool,
                repository,
                Stage::TelegramIngest,
                TelegramIngestHandler,
            )
            .await
        }
        Role::WorkerNormalize => {
            run_worker(config, pool, repository, Stage::Normalize, NormalizeHandler).await
        }
        Role::WorkerEvaluate => {
            run_worker(config, pool, repository, Stage::Evaluate, EvaluateHandler).await
        }
        Role::WorkerDeliver => {
            run_worker(config, pool, repository, Stage::Deliver, DeliverHandler).await
        }
    }
}

async fn run_api(
    config: ServiceConfig,
    pool: sqlx::PgPool,
    repository: Arc<dyn scheduler_core::ClaimRepository>,
) -> Result<()> {
    let app = http::build_app(http::AppState { pool, repository });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    tracing::info!(%addr, "serving HTTP ingress");
    axum::serve(listener, app).await.context("HTTP server error")?;
    Ok(())
}

async fn run_worker<H>(
    config: ServiceConfig,
    pool: sqlx::PgPool,
    repository: Arc<dyn scheduler_core::ClaimRepository>,
    stage: Stage,
    handler: H,
) -> Result<()>
where
    H: scheduler_core::StageHandler<ServiceDeps> + 'static,
{
    let deps = ServiceDeps {
        pool,
        repository: repository.clone(),
    };

    let worker_loop = WorkerLoop::new(
        repository,
        handler,
        deps,
        WorkerLoopConfig {
            stage,
            worker_id: format!("{}-{}", stage, std::process::id()),
            lease_seconds: config.scheduler.claim_lease_seconds,
            heartbeat_interval_ms: config.scheduler.heartbeat_interval_ms,
            max_attempts: config.scheduler.max_attempts,
            reclaim_batch_limit: config.scheduler.reclaim_batch_limit,
        },
    );

    let runner = Runner::new(
        worker_loop,
        RunnerTimings {
            poll_interval: std::time::Duration::from_millis(config.scheduler.poll_interval_ms),
            idle_backoff: std::time::Duration::from_millis(config.scheduler.idle_backoff_ms),
            error_backoff: std::time::Duration::from_millis(config.scheduler.error_backoff_ms),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    tracing::info!(%stage, "running worker loop");
    runner.run(shutdown).await;
    Ok(())
}
