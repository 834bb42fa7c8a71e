//! Session endpoints.
//!
//! - `POST   /v1/sessions`                     create a session (201)
//! - `GET    /v1/sessions`                     list sessions, newest activity first
//! - `DELETE /v1/sessions/:session_id`         delete a session and its history
//! - `GET    /v1/sessions/:session_id/messages` recent committed messages
//! - `GET    /v1/sessions/:session_id/tasks`   tasks still tracked for the session

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use tg_domain::config::MAX_CONTEXT_WINDOW;

use crate::state::AppState;

use super::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let title = body.and_then(|Json(b)| b.title);
    let entry = state.engine.create_session(title).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn list_sessions(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.engine.list_sessions().await?;
    Ok(Json(serde_json::json!({
        "sessions": sessions,
        "count": sessions.len(),
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, MAX_CONTEXT_WINDOW);
    let messages = state.engine.history(&session_id, limit).await?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "messages": messages,
    })))
}

pub async fn tasks(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let tasks = state.engine.tasks(&session_id);
    Json(serde_json::json!({
        "session_id": session_id,
        "tasks": tasks,
    }))
}
