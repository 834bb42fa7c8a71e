//! In-memory [`TurnStorage`].  Nothing survives the process.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use tg_domain::error::{Error, Result};
use tg_domain::message::ChatMessage;

use crate::storage::{tail, TurnRecord, TurnStorage};
use crate::store::SessionEntry;

struct MemorySession {
    entry: SessionEntry,
    messages: Vec<ChatMessage>,
    committed: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStorage {
    sessions: RwLock<HashMap<String, MemorySession>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a caller-chosen ID.
    pub fn insert_session(&self, session_id: &str) -> SessionEntry {
        let mut entry = SessionEntry::new(None);
        entry.session_id = session_id.to_owned();
        self.sessions.write().insert(
            session_id.to_owned(),
            MemorySession {
                entry: entry.clone(),
                messages: Vec::new(),
                committed: HashSet::new(),
            },
        );
        entry
    }

    /// Committed turns for a session (0 if unknown).
    pub fn turn_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map_or(0, |s| s.committed.len())
    }
}

#[async_trait::async_trait]
impl TurnStorage for MemoryStorage {
    async fn create_session(&self, title: Option<String>) -> Result<SessionEntry> {
        let entry = SessionEntry::new(title);
        self.sessions.write().insert(
            entry.session_id.clone(),
            MemorySession {
                entry: entry.clone(),
                messages: Vec::new(),
                committed: HashSet::new(),
            },
        );
        Ok(entry)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.read().contains_key(session_id))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionEntry>> {
        Ok(self.sessions.read().get(session_id).map(|s| s.entry.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionEntry>> {
        let mut entries: Vec<SessionEntry> =
            self.sessions.read().values().map(|s| s.entry.clone()).collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.write().remove(session_id).is_some())
    }

    async fn append_turn(&self, turn: &TurnRecord) -> Result<bool> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&turn.session_id).ok_or_else(|| {
            Error::Storage(format!("session {} does not exist", turn.session_id))
        })?;

        if !session.committed.insert(turn.request_id.clone()) {
            return Ok(false);
        }
        session.messages.extend(turn.to_messages());
        session.entry.turns += 1;
        session.entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let messages = self
            .sessions
            .read()
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default();
        Ok(tail(messages, limit))
    }
}
