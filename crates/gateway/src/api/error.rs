use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::runtime::error::EngineError;
use crate::runtime::queue::QueueError;

/// Build a standardized JSON error response:
/// `{ "error": { "code": "<CODE>", "message": "<message>" } }`.
pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": { "code": code, "message": message.into() }
        })),
    )
        .into_response()
}

/// Engine failure rendered as an HTTP error.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::EmptyMessage => StatusCode::BAD_REQUEST,
            EngineError::SessionNotFound { .. } | EngineError::TaskNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            EngineError::SubmissionRejected(QueueError::Full) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::SubmissionRejected(QueueError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }
        api_error(status, self.0.code(), self.0.to_string())
    }
}
