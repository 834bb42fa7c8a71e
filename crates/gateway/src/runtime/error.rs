//! Typed failures of the turn engine.
//!
//! Every variant carries a stable machine code (see [`EngineError::code`])
//! that is shared by HTTP error bodies and `error` stream frames.

use std::time::Duration;

use super::queue::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to enqueue chat job (cause={0})")]
    SubmissionRejected(QueueError),

    #[error("chat session not found (cause=session_id={session_id})")]
    SessionNotFound { session_id: String },

    #[error("chat task not found (cause=session_id={session_id}, request_id={request_id})")]
    TaskNotFound {
        session_id: String,
        request_id: String,
    },

    #[error("user query must not be empty")]
    EmptyMessage,

    #[error("response generation failed (cause={cause})")]
    BackendFailure { cause: String },

    #[error("stream timeout (cause=no terminal event within {}s)", .timeout.as_secs_f64())]
    StreamTimeout { timeout: Duration },

    #[error("stream protocol violation (cause={reason})")]
    ProtocolViolation { reason: String },

    #[error("failed to persist turn {request_id} after {attempts} attempt(s) (cause={cause})")]
    PersistenceFailure {
        request_id: String,
        attempts: u32,
        cause: String,
    },

    #[error("session storage failed (cause={0})")]
    Storage(#[from] tg_domain::error::Error),
}

impl EngineError {
    /// Stable error code for API bodies and stream frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SubmissionRejected(QueueError::Full) => "CHAT_QUEUE_FULL",
            Self::SubmissionRejected(QueueError::Closed) => "CHAT_JOB_QUEUE_FAILED",
            Self::SessionNotFound { .. } => "CHAT_SESSION_NOT_FOUND",
            Self::TaskNotFound { .. } => "CHAT_TASK_NOT_FOUND",
            Self::EmptyMessage => "CHAT_MESSAGE_EMPTY",
            Self::BackendFailure { .. } => "CHAT_BACKEND_FAILED",
            Self::StreamTimeout { .. } => "CHAT_STREAM_TIMEOUT",
            Self::ProtocolViolation { .. } => "CHAT_PROTOCOL_VIOLATION",
            Self::PersistenceFailure { .. } => "CHAT_PERSIST_FAILED",
            Self::Storage(_) => "CHAT_STORAGE_FAILED",
        }
    }

    pub fn backend(cause: impl std::fmt::Display) -> Self {
        Self::BackendFailure {
            cause: cause.to_string(),
        }
    }

    pub fn task_not_found(session_id: &str, request_id: &str) -> Self {
        Self::TaskNotFound {
            session_id: session_id.to_owned(),
            request_id: request_id.to_owned(),
        }
    }
}
