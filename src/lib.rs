//! apipulse -- self-hosted API test automation engine.
//!
//! This crate provides the core library for executing stored API test
//! tasks: variable resolution, HTTP case execution, sandboxed assertion
//! scripts, result aggregation, and cron scheduling.

pub mod api;
pub mod config;
pub mod engine;
pub mod model;
pub mod scheduler;
pub mod storage;

use anyhow::Result;

/// Start the apipulse daemon: API server and scheduler.
pub async fn serve(config: config::Config) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path=%config.db_path, "Initializing database");
    let pool = storage::open_pool(&config.db_path)?;

    // 2. Initialize engine context and scheduler
    let ctx = engine::EngineContext::new(pool, &config)?;
    let scheduler = scheduler::Scheduler::new(ctx.clone(), config.overlap_policy);
    scheduler.load_jobs().await?;

    // 3. Start Scheduler Engine (background task)
    let scheduler_engine = scheduler.clone();
    let poll_interval = config.poll_interval();
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler_engine, poll_interval).await;
    });

    // 4. Start API Server
    let addr: std::net::SocketAddr = config.bind.parse()?;
    let app = api::router(api::state::AppState { ctx, scheduler });

    tracing::info!(%addr, "apipulse listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
