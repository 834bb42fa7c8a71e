use serde::{Deserialize, Serialize};

use tg_domain::error::Result;
use tg_domain::message::{ChatMessage, Role};

use crate::store::SessionEntry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One finished turn, ready to be committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub session_id: String,
    /// Idempotency key.
    pub request_id: String,
    pub user_message: String,
    /// Final assistant content.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TurnRecord {
    /// The two history messages this turn contributes, user first.
    pub fn to_messages(&self) -> [ChatMessage; 2] {
        let now = chrono::Utc::now();
        [
            ChatMessage {
                role: Role::User,
                content: self.user_message.clone(),
                timestamp: now,
                request_id: Some(self.request_id.clone()),
                metadata: None,
            },
            ChatMessage {
                role: Role::Assistant,
                content: self.content.clone(),
                timestamp: now,
                request_id: Some(self.request_id.clone()),
                metadata: self.metadata.clone(),
            },
        ]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable session history.
///
/// `append_turn` must be idempotent on `request_id`: the first call
/// commits and returns `true`, every later call with the same id returns
/// `false` and writes nothing.
#[async_trait::async_trait]
pub trait TurnStorage: Send + Sync {
    async fn create_session(&self, title: Option<String>) -> Result<SessionEntry>;

    async fn session_exists(&self, session_id: &str) -> Result<bool>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionEntry>>;

    /// Most recently updated first.
    async fn list_sessions(&self) -> Result<Vec<SessionEntry>>;

    /// Returns `false` if the session did not exist.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    async fn append_turn(&self, turn: &TurnRecord) -> Result<bool>;

    /// The last `limit` messages of a session, oldest first.
    async fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Persist any buffered index state.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Keep the last `limit` items of `messages`, preserving order.
pub(crate) fn tail(mut messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    if messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }
    messages
}
