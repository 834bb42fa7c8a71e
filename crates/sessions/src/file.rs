//! File-backed [`TurnStorage`]: `sessions.json` index plus JSONL transcripts.

use std::path::Path;

use tg_domain::error::{Error, Result};
use tg_domain::message::ChatMessage;

use crate::storage::{tail, TurnRecord, TurnStorage};
use crate::store::{SessionEntry, SessionStore};
use crate::transcript::TranscriptWriter;

pub struct FileStorage {
    index: SessionStore,
    transcripts: TranscriptWriter,
    /// Serializes the duplicate check with the append in `append_turn`.
    commit_lock: tokio::sync::Mutex<()>,
}

impl FileStorage {
    pub fn open(state_path: &Path) -> Result<Self> {
        let index = SessionStore::new(state_path)?;
        let transcripts = TranscriptWriter::new(&index.transcript_dir());
        Ok(Self {
            index,
            transcripts,
            commit_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait::async_trait]
impl TurnStorage for FileStorage {
    async fn create_session(&self, title: Option<String>) -> Result<SessionEntry> {
        let entry = self.index.create(title);
        self.index.flush().await?;
        Ok(entry)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.index.contains(session_id))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionEntry>> {
        Ok(self.index.get(session_id))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionEntry>> {
        Ok(self.index.list())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        if self.index.remove(session_id).is_none() {
            return Ok(false);
        }
        self.transcripts.remove(session_id).await?;
        self.index.flush().await?;
        Ok(true)
    }

    async fn append_turn(&self, turn: &TurnRecord) -> Result<bool> {
        if !self.index.contains(&turn.session_id) {
            return Err(Error::Storage(format!(
                "session {} does not exist",
                turn.session_id
            )));
        }

        let _guard = self.commit_lock.lock().await;
        if self
            .transcripts
            .contains_request(&turn.session_id, &turn.request_id)
            .await?
        {
            tracing::debug!(
                session_id = %turn.session_id,
                request_id = %turn.request_id,
                "turn already committed"
            );
            return Ok(false);
        }

        self.transcripts
            .append_async(&turn.session_id, &turn.to_messages())
            .await?;
        self.index.record_turn(&turn.session_id);
        Ok(true)
    }

    async fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let lines = self.transcripts.read_async(session_id).await?;
        Ok(tail(lines, limit))
    }

    async fn flush(&self) -> Result<()> {
        self.index.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_domain::message::Role;

    fn record(session_id: &str, request_id: &str) -> TurnRecord {
        TurnRecord {
            session_id: session_id.into(),
            request_id: request_id.into(),
            user_message: "hi".into(),
            content: "hello".into(),
            metadata: Some(serde_json::json!({ "token_count": 1 })),
        }
    }

    #[tokio::test]
    async fn append_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let session = storage.create_session(None).await.unwrap();

        assert!(storage.append_turn(&record(&session.session_id, "r1")).await.unwrap());
        assert!(!storage.append_turn(&record(&session.session_id, "r1")).await.unwrap());
        storage.flush().await.unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        assert!(!reopened.append_turn(&record(&session.session_id, "r1")).await.unwrap());
        let history = reopened.load_recent(&session.session_id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(
            reopened.get_session(&session.session_id).await.unwrap().unwrap().turns,
            1
        );
    }

    #[tokio::test]
    async fn append_to_unknown_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let err = storage.append_turn(&record("ghost", "r1")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn load_recent_keeps_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let sid = storage.create_session(None).await.unwrap().session_id;
        for i in 0..3 {
            storage.append_turn(&record(&sid, &format!("r{i}"))).await.unwrap();
        }
        let recent = storage.load_recent(&sid, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].role, Role::Assistant);
        assert_eq!(recent[2].request_id.as_deref(), Some("r2"));
        assert!(storage.load_recent(&sid, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_index_and_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let sid = storage.create_session(None).await.unwrap().session_id;
        storage.append_turn(&record(&sid, "r1")).await.unwrap();

        assert!(storage.delete_session(&sid).await.unwrap());
        assert!(!storage.session_exists(&sid).await.unwrap());
        assert!(!dir.path().join(format!("sessions/{sid}.jsonl")).exists());
        assert!(!storage.delete_session(&sid).await.unwrap());
    }
}
