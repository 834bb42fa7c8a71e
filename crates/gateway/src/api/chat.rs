//! Turn endpoints.
//!
//! - `POST /v1/chat`                                submit a turn (202)
//! - `GET  /v1/chat/:session_id/:request_id/status` task status
//! - `GET  /v1/chat/:session_id/:request_id/result` final content or error
//! - `GET  /v1/chat/:session_id/:request_id/stream` SSE frames until terminal

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;

use crate::runtime::{SubmitRequest, TaskResult, TaskState};
use crate::state::AppState;

use super::error::{api_error, ApiError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn submit(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "CHAT_BAD_REQUEST",
                rejection.body_text(),
            );
        }
    };

    match state.engine.submit(req).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/chat/:session_id/:request_id/status|result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn status(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Result<Json<TaskState>, ApiError> {
    Ok(Json(state.engine.status(&session_id, &request_id)?))
}

pub async fn result(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Result<Json<TaskResult>, ApiError> {
    Ok(Json(state.engine.result(&session_id, &request_id)?))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/chat/:session_id/:request_id/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One SSE `message` event per frame.  The response ends after the
/// terminal frame; a client disconnect drops the relay and frees its
/// bucket.
pub async fn stream(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Response {
    let frames = match state.engine.stream(&session_id, &request_id) {
        Ok(frames) => frames,
        Err(e) => return ApiError(e).into_response(),
    };

    let events = frames.map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("message").data(data))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
