use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node that emits `start` and `error`.
pub const NODE_EXECUTOR: &str = "executor";
/// Node that emits `token` and, by default, `done`.
pub const NODE_RESPONSE: &str = "response";
/// Node that emits `references`.
pub const NODE_REFERENCES: &str = "rag";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Token,
    References,
    Done,
    Error,
}

impl EventType {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Token => "token",
            Self::References => "references",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// One progress event pushed by a worker into the event buffer.
///
/// Never persisted.  `data` is the textual payload (token text, final
/// content, error message); structured extras ride in `metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub event_type: EventType,
    pub node: String,
    pub data: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl StreamEvent {
    fn new(event_type: EventType, node: &str, request_id: &str, data: String) -> Self {
        Self {
            event_type,
            node: node.to_owned(),
            data,
            request_id: request_id.to_owned(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn start(request_id: &str) -> Self {
        Self::new(EventType::Start, NODE_EXECUTOR, request_id, String::new())
    }

    pub fn token(request_id: &str, text: impl Into<String>) -> Self {
        Self::new(EventType::Token, NODE_RESPONSE, request_id, text.into())
    }

    pub fn references(request_id: &str, payload: Value) -> Self {
        let mut ev = Self::new(EventType::References, NODE_REFERENCES, request_id, String::new());
        ev.metadata = Some(serde_json::json!({ "references": payload }));
        ev
    }

    pub fn done(request_id: &str, node: &str, content: String, metadata: Option<Value>) -> Self {
        let mut ev = Self::new(EventType::Done, node, request_id, content);
        ev.metadata = metadata;
        ev
    }

    /// `code` lands in `metadata.code`, the message in `data`.
    pub fn error(request_id: &str, code: &str, message: impl Into<String>) -> Self {
        let mut ev = Self::new(EventType::Error, NODE_EXECUTOR, request_id, message.into());
        ev.metadata = Some(serde_json::json!({ "code": code }));
        ev
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
