pub mod chat;
pub mod cors;
pub mod error;
pub mod health;
pub mod sessions;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health::health))
        // Sessions
        .route(
            "/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/v1/sessions/:session_id", delete(sessions::delete_session))
        .route("/v1/sessions/:session_id/messages", get(sessions::messages))
        .route("/v1/sessions/:session_id/tasks", get(sessions::tasks))
        // Turns
        .route("/v1/chat", post(chat::submit))
        .route("/v1/chat/:session_id/:request_id/status", get(chat::status))
        .route("/v1/chat/:session_id/:request_id/result", get(chat::result))
        .route("/v1/chat/:session_id/:request_id/stream", get(chat::stream))
}

/// The router with CORS, the in-flight request cap and HTTP tracing
/// applied, bound to `state`.
pub fn app(state: AppState) -> Router {
    let max_concurrent = state.config.server.max_concurrent_requests.max(1);
    tracing::info!(max_concurrent, "concurrency limit set");

    router()
        .layer(cors::build_cors_layer(&state.config.server.cors))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
