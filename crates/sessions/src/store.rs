//! Session index.
//!
//! Persists session entries in `sessions.json` under the storage path.
//! Each session ID maps to a `SessionEntry` with its title, timestamps and
//! committed turn count.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tg_domain::error::{Error, Result};
use tg_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Committed turns.
    #[serde(default)]
    pub turns: u64,
}

impl SessionEntry {
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            title,
            created_at: now,
            updated_at: now,
            turns: 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session index backed by a JSON file.
pub struct SessionStore {
    sessions_path: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    /// Load or create the index at `state_path/sessions/sessions.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let sessions_path = dir.join("sessions.json");
        let sessions: HashMap<String, SessionEntry> = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %sessions_path.display(),
                    error = %e,
                    "unreadable session index, starting empty"
                );
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Mint a new session.
    pub fn create(&self, title: Option<String>) -> SessionEntry {
        let entry = SessionEntry::new(title);
        self.sessions
            .write()
            .insert(entry.session_id.clone(), entry.clone());

        TraceEvent::SessionCreated {
            session_id: entry.session_id.clone(),
        }
        .emit();

        entry
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        let removed = self.sessions.write().remove(session_id);
        if removed.is_some() {
            TraceEvent::SessionDeleted {
                session_id: session_id.to_owned(),
            }
            .emit();
        }
        removed
    }

    /// Bump the turn counter and `updated_at`.
    pub fn record_turn(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.turns += 1;
            entry.updated_at = Utc::now();
        }
    }

    /// All entries, most recently updated first.
    pub fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self.sessions.read().values().cloned().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries
    }

    /// Persist the current index to disk.
    pub async fn flush(&self) -> Result<()> {
        let json = {
            let sessions = self.sessions.read();
            serde_json::to_string_pretty(&*sessions)
                .map_err(|e| Error::Other(format!("serializing sessions: {e}")))?
        };
        tokio::fs::write(&self.sessions_path, json)
            .await
            .map_err(Error::Io)
    }

    /// Directory holding the per-session transcripts.
    pub fn transcript_dir(&self) -> PathBuf {
        self.sessions_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf()
    }
}
