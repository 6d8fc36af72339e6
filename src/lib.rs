//! orgcron -- multi-tenant cron scheduling for host-registered target functions.
//!
//! This crate provides the scheduling core (cron planning, per-job timers,
//! execution with real cancellation, failure thresholds), SQLite persistence,
//! and an HTTP adapter for the control surface.

pub mod api;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::OrgcronConfig;
use crate::scheduler::{AllowAll, JobService, TargetRegistry};

/// Open the configured database and wire a service around it. The
/// registry is not started.
pub fn open_service(config: &OrgcronConfig, targets: TargetRegistry) -> Result<JobService> {
    let db_path = config.storage.database_path.to_string_lossy();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    Ok(JobService::new(
        Arc::new(storage::SqliteJobStore::new(pool.clone())),
        Arc::new(storage::SqliteExecutionLog::new(
            pool,
            config.scheduler.history_limit_per_job,
        )),
        Arc::new(targets),
        Arc::new(AllowAll),
        config.scheduler.max_timeout_seconds,
    ))
}

/// Start the orgcron daemon: scheduler, periodic resync, API server.
pub async fn serve(config: OrgcronConfig) -> Result<()> {
    // 1. Storage + service
    let service = Arc::new(open_service(&config, scheduler::builtin::registry()?)?);

    // 2. Arm every enabled job
    service.start();
    let armed = service.bootstrap_on_startup(None).await?;
    tracing::info!(armed, "Scheduler started");

    // 3. Periodic resync (background task)
    let shutdown = CancellationToken::new();
    if let Some(interval) = config.scheduler.reconcile_interval() {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.resync().await {
                            tracing::warn!(error = %e, "Scheduler resync failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    // 4. API server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let app = api::router(api::state::AppState {
        service: service.clone(),
    });

    tracing::info!(%addr, "orgcron listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 5. Drain
    shutdown.cancel();
    service.stop(config.scheduler.shutdown_grace()).await;
    tracing::info!("orgcron stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
