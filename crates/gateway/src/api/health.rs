use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/health : health probe with engine gauges
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.engine.stats();
    let status = if state.engine.is_accepting() {
        "ok"
    } else {
        "draining"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "queue_depth": stats.queue_depth,
        "workers": stats.workers,
        "tasks": stats.tasks,
        "buckets": stats.buckets,
        "session_locks": stats.session_locks,
        "persistence": stats.persistence,
    }))
}
