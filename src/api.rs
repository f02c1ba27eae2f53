//! REST endpoints for triggering polls and inspecting the run ledger.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::{error, info};

use crate::pipeline::PollingPipeline;
use crate::store::RecordStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PollingPipeline>,
    pub store: Arc<dyn RecordStore>,
}

/// Build the Axum router with the trigger and ledger routes.
pub fn api_routes(pipeline: Arc<PollingPipeline>, store: Arc<dyn RecordStore>) -> Router {
    let state = AppState { pipeline, store };

    Router::new()
        .route("/health", get(health))
        .route("/api/runs", post(trigger_runs))
        .route("/api/runs/recent", get(recent_runs))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "parseit"
    }))
}

// ── Runs ────────────────────────────────────────────────────────────────

/// Poll every configured mailbox now, regardless of schedule.
async fn trigger_runs(State(state): State<AppState>) -> impl IntoResponse {
    info!("Manual poll requested");
    match state.pipeline.run_all().await {
        Ok(summaries) => (StatusCode::OK, Json(serde_json::json!(summaries))),
        Err(e) => {
            error!(error = %e, "Manual poll could not list mailboxes");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

async fn recent_runs(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_recent_runs(20).await {
        Ok(runs) => (StatusCode::OK, Json(serde_json::json!(runs))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
