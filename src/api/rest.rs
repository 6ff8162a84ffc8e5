// =============================================================================
// Status API: Axum 0.7
// =============================================================================
//
// Read-only endpoints for operators and liveness probes:
//   GET /health        liveness, always 200 while the process runs.
//   GET /api/v1/stats  counters of both services as JSON.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::app_state::PipelineStats;

pub fn router(stats: Arc<PipelineStats>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/stats", get(stats_handler))
        .with_state(stats)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(stats): State<Arc<PipelineStats>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: stats.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn stats_handler(State(stats): State<Arc<PipelineStats>>) -> impl IntoResponse {
    Json(stats.snapshot())
}

/// Serve the status API on `addr` until `shutdown` flips.
pub async fn serve(addr: &str, stats: Arc<PipelineStats>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status API on {addr}"))?;
    info!(addr = %addr, "status API listening");
    axum::serve(listener, router(stats))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("status API failed")
}
