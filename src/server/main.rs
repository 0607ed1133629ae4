//! Entry point: one executable, no subcommands. Exit 0 on graceful shutdown,
//! non-zero on fatal startup error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gateway_core::kernel::{Intake, ProcessRunner, Scheduler, SqliteJobStore, WebhookDispatcher};
use gateway_core::server::{build_app, AppState};
use gateway_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gateway_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting assistant gateway");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        workers = config.worker_count,
        queue_capacity = config.queue_capacity,
        "configuration loaded"
    );

    let store: Arc<dyn gateway_core::kernel::JobStore> =
        Arc::new(SqliteJobStore::connect(&config.database_path).await?);
    tracing::info!(path = %config.database_path, "database ready");

    let process_runner = Arc::new(ProcessRunner::new(config.assistant_path.clone()));
    let webhook = Arc::new(WebhookDispatcher::new());

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        process_runner,
        webhook,
        config.queue_capacity,
        config.worker_count,
        config.job_timeout_minutes,
        config.job_ttl_hours,
        config.cleanup_interval_minutes,
        config.security_prompt().to_string(),
    ));

    // Recovery MUST run before any worker is spawned.
    scheduler
        .recover()
        .await
        .context("crash recovery failed")?;

    let shutdown = CancellationToken::new();
    let worker_handles = scheduler.start(shutdown.clone());

    let intake = Arc::new(Intake::new(
        store.clone(),
        scheduler.clone(),
        config.default_model.clone(),
    ));

    let state = AppState {
        intake,
        config: Arc::new(config.clone()),
    };

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "listening");

    let shutdown_for_signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_terminate_signal().await;
        tracing::info!("shutdown signal received, draining");
        shutdown_for_signal.cancel();
    })
    .await
    .context("server error")?;

    // Allow in-flight workers and the cleanup task up to 10 seconds to drain.
    let drain = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join_all(worker_handles),
    )
    .await;
    if drain.is_err() {
        tracing::warn!("drain timeout elapsed, exiting anyway");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_terminate_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
