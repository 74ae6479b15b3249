//! Kiln server
//!
//! Entry point for the kiln binary: configuration loading, database
//! migrations, the HTTP enqueue/admin API and the worker loops.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kiln_config::Config;
use kiln_job_queue::{JobQueueClient, Worker};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use kiln_server::state::AppState;

mod cli;
mod config_helpers;
mod tracing_setup;

use cli::{Cli, Command};
use config_helpers::{
    database_config_from_config, parse_bind_address, queue_settings_from_config,
    worker_config_from_config,
};
use tracing_setup::install_tracing_from_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    install_tracing_from_config(&config.logging);

    let db_cfg = database_config_from_config(&config);
    let db_pool = kiln_db_connection::create_pool(&db_cfg)
        .await
        .context("failed to create database pool")?;
    tracing::info!(
        db_url = %kiln_db_connection::utils::sanitize_database_url(&db_cfg.url),
        db_max_connections = db_cfg.max_connections,
        "database pool created"
    );
    run_migrations(&db_pool).await?;

    let job_queue =
        JobQueueClient::sql(db_pool).with_settings(queue_settings_from_config(&config));

    match cli.command() {
        Command::Migrate => Ok(()),
        Command::Worker { once: true } => {
            let worker = Worker::new(job_queue, worker_config_from_config(&config, 0, 1));
            let processed = worker.run_until_idle().await?;
            tracing::info!(worker.id = worker.id(), processed, "queue drained");
            Ok(())
        }
        Command::Worker { once: false } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let workers = spawn_workers(&config, &job_queue, 1, &shutdown_rx);
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
            join_workers(workers).await;
            Ok(())
        }
        Command::Serve { workers } => {
            let count = workers.unwrap_or(config.worker.embedded_workers);
            serve(&config, job_queue, count).await
        }
    }
}

/// Run the HTTP API with `worker_count` embedded workers until interrupted.
async fn serve(config: &Config, job_queue: JobQueueClient, worker_count: usize) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(config, &job_queue, worker_count, &shutdown_rx);

    let state = AppState::new(job_queue).with_admin_token(config.api.admin_token.clone());
    if state.admin_token().is_none() {
        tracing::warn!("no admin token configured; job routes are unauthenticated");
    }
    let app = kiln_server::build_router(Arc::new(state));

    let addr = parse_bind_address(&config.server.host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, embedded_workers = worker_count, "server listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await;

    // Workers finish the job in hand before exiting.
    join_workers(workers).await;
    served.context("server error")
}

fn spawn_workers(
    config: &Config,
    job_queue: &JobQueueClient,
    count: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let worker = Worker::new(
                job_queue.clone(),
                worker_config_from_config(config, index, count),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        if let Err(error) = handle.await {
            tracing::error!(%error, "worker task ended abnormally");
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

/// Load and validate configuration from file or defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = kiln_config::load_config(path)
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;
    kiln_config::validate_config(&config)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn run_migrations(db_pool: &kiln_db_connection::DbPool) -> anyhow::Result<()> {
    tracing::info!("applying SQLite migrations");
    match kiln_migrations::sqlite_migrator().run(db_pool).await {
        Ok(()) => {
            tracing::info!("database migrations applied successfully");
            Ok(())
        }
        Err(e) => {
            tracing::error!(%e, "failed to apply database migrations");
            Err(anyhow::anyhow!("failed to apply database migrations: {e}"))
        }
    }
}
