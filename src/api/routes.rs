//! API route definitions.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::analysis::AggregateStats;
use crate::detect::{AnomalyRecord, AnomalyType};
use crate::event::{Event, EventKind, MusicInfo, RunningStats};
use crate::eventlog::HistoryCounts;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/running_stats", post(receive_running_stats))
        .route("/music_info", post(receive_music_info))
        .route("/stats", get(get_stats))
        .route("/anomalies", get(list_anomalies))
        .route("/history/running_stats", get(history_running_stats))
        .route("/history/music_info", get(history_music_info))
        .route("/history/stats", get(history_stats))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Receiver: accepts events and enqueues them with a fresh trace id
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewRunningStats {
    pub user_id: String,
    pub distance: f64,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewMusicInfo {
    pub user_id: String,
    pub song_name: String,
    pub artist: String,
    pub song_duration: f64,
    pub timestamp: DateTime<Utc>,
}

async fn receive_running_stats(
    State(state): State<AppState>,
    Json(body): Json<NewRunningStats>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let trace_id = Uuid::new_v4().to_string();
    let event = Event::RunningStats(RunningStats {
        user_id: body.user_id,
        trace_id: trace_id.clone(),
        distance: body.distance,
        duration: body.duration,
        timestamp: body.timestamp,
    });
    publish(&state, event).await?;
    Ok((StatusCode::CREATED, Json(json!({ "trace_id": trace_id }))))
}

async fn receive_music_info(
    State(state): State<AppState>,
    Json(body): Json<NewMusicInfo>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let trace_id = Uuid::new_v4().to_string();
    let event = Event::MusicInfo(MusicInfo {
        user_id: body.user_id,
        trace_id: trace_id.clone(),
        song_name: body.song_name,
        artist: body.artist,
        song_duration: body.song_duration,
        timestamp: body.timestamp,
    });
    publish(&state, event).await?;
    Ok((StatusCode::CREATED, Json(json!({ "trace_id": trace_id }))))
}

async fn publish(state: &AppState, event: Event) -> ApiResult<u64> {
    let log = state.log.clone();
    blocking(move || {
        let offset = log.publish(&event)?;
        info!(offset, trace_id = %event.trace_id(), kind = %event.kind(), "event received");
        Ok(offset)
    })
    .await
}

/// Run a store call on the blocking pool. Every store here goes through
/// rusqlite, and a history replay can scan the whole log.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<AggregateStats>> {
    let stats = state.stats.clone();
    blocking(move || Ok(stats.snapshot()?)).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    pub anomaly_type: Option<String>,
}

async fn list_anomalies(
    State(state): State<AppState>,
    Query(q): Query<AnomalyQuery>,
) -> ApiResult<Json<Vec<AnomalyRecord>>> {
    let filter = q
        .anomaly_type
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<AnomalyType>)
        .transpose()?;
    let anomalies = state.anomalies.clone();
    blocking(move || Ok(anomalies.query(filter)?)).await.map(Json)
}

// ---------------------------------------------------------------------------
// History: replays the log from the beginning
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IndexQuery {
    pub index: u64,
}

async fn history_running_stats(
    State(state): State<AppState>,
    Query(q): Query<IndexQuery>,
) -> ApiResult<Json<Event>> {
    history_event(&state, EventKind::RunningStats, q.index).await
}

async fn history_music_info(
    State(state): State<AppState>,
    Query(q): Query<IndexQuery>,
) -> ApiResult<Json<Event>> {
    history_event(&state, EventKind::MusicInfo, q.index).await
}

async fn history_event(state: &AppState, kind: EventKind, index: u64) -> ApiResult<Json<Event>> {
    let history = state.history.clone();
    blocking(move || {
        history
            .nth_event(kind, index)?
            .ok_or_else(|| ApiError::NotFound("Not Found".into()))
    })
    .await
    .map(Json)
}

async fn history_stats(State(state): State<AppState>) -> ApiResult<Json<HistoryCounts>> {
    let history = state.history.clone();
    blocking(move || Ok(history.counts()?)).await.map(Json)
}
