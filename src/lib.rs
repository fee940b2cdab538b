//! telemetry-pipeline -- consumes running and music telemetry from a durable
//! event log, flags anomalous values, and keeps aggregate statistics.
//!
//! The library holds the consumption loop and its stores; the binary wires
//! them to an HTTP API and a CLI.

pub mod analysis;
pub mod api;
pub mod config;
pub mod detect;
pub mod event;
pub mod eventlog;
pub mod ingest;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::analysis::StatsStore;
use crate::config::AppConfig;
use crate::detect::AnomalyStore;
use crate::eventlog::{SqliteConnector, SqliteEventLog};
use crate::ingest::Consumer;

/// Open the stores and the event log described by `config`.
pub fn open_state(config: &AppConfig) -> Result<api::state::AppState> {
    let pool = storage::open_pool(&config.datastore.path).with_context(|| {
        format!(
            "failed to open datastore at {}",
            config.datastore.path.display()
        )
    })?;
    let stats = StatsStore::new(pool.clone());
    stats.initialize().context("failed to initialize statistics")?;

    let log = SqliteEventLog::open(&config.log.endpoint, &config.log.topic).with_context(|| {
        format!(
            "failed to open event log at {}",
            config.log.endpoint.display()
        )
    })?;

    Ok(api::state::AppState::new(stats, AnomalyStore::new(pool), log))
}

/// Run the consumer and the HTTP API until `shutdown` is cancelled.
pub async fn serve(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    // 1. Storage and event log
    tracing::info!(
        datastore = %config.datastore.path.display(),
        event_log = %config.log.endpoint.display(),
        topic = %config.log.topic,
        "initializing"
    );
    let state = open_state(&config)?;

    // 2. Consumer (background task)
    let connector = Arc::new(SqliteConnector::from_config(&config.log));
    let consumer = Consumer::new(
        connector,
        &config,
        state.stats.clone(),
        state.anomalies.clone(),
    );
    let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));

    // 3. API server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let app = api::router(state);

    tracing::info!(%addr, "telemetry pipeline listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // Let the consumer finish its current message.
    shutdown.cancel();
    consumer_task.await.context("consumer task panicked")?;
    tracing::info!("shutdown complete");
    Ok(())
}
