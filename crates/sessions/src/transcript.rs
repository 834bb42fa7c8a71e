//! Append-only JSONL transcripts.
//!
//! Each session gets a `<session_id>.jsonl` file under the sessions
//! directory.  Every committed message is appended as a single JSON line.
//!
//! An in-memory write-through cache avoids re-reading from disk every
//! turn; file I/O runs on `spawn_blocking` so the tokio runtime is never
//! blocked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tg_domain::error::{Error, Result};
use tg_domain::message::ChatMessage;
use tg_domain::trace::TraceEvent;

/// Writes append-only JSONL transcript files with an in-memory write-through
/// cache so reads never hit disk after the first load.
pub struct TranscriptWriter {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl TranscriptWriter {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }

    /// Append messages to a session's transcript.
    ///
    /// All lines go out in a single write; the cache is only updated once
    /// the write succeeded.
    pub async fn append_async(&self, session_id: &str, lines: &[ChatMessage]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        // Make sure the cache holds the on-disk history before extending it.
        self.read_async(session_id).await?;

        let buf = serialize_lines(lines)?;
        let path = self.path_for(session_id);

        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(Error::Io)?;
            file.write_all(buf.as_bytes()).map_err(Error::Io)?;
            file.sync_data().map_err(Error::Io)?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;

        self.cache
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .extend(lines.iter().cloned());

        TraceEvent::TranscriptAppend {
            session_id: session_id.to_owned(),
            lines: lines.len(),
        }
        .emit();

        Ok(())
    }

    /// Read back a transcript.  Returns cached lines if available,
    /// otherwise loads from disk and populates the cache.
    pub async fn read_async(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        if let Some(lines) = self.cache.read().get(session_id) {
            return Ok(lines.clone());
        }

        let path = self.path_for(session_id);
        let sid = session_id.to_owned();
        let lines = tokio::task::spawn_blocking(move || read_jsonl_file(&path, &sid))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;

        // Another reader may have raced us; keep whichever landed first.
        let mut cache = self.cache.write();
        Ok(cache
            .entry(session_id.to_owned())
            .or_insert(lines)
            .clone())
    }

    /// Whether any line of the transcript belongs to `request_id`.
    pub async fn contains_request(&self, session_id: &str, request_id: &str) -> Result<bool> {
        self.read_async(session_id).await?;
        Ok(self
            .cache
            .read()
            .get(session_id)
            .is_some_and(|lines| {
                lines
                    .iter()
                    .any(|l| l.request_id.as_deref() == Some(request_id))
            }))
    }

    /// Delete a transcript file and its cache entry.
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        self.cache.write().remove(session_id);
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Serialize messages to a JSONL string.
fn serialize_lines(lines: &[ChatMessage]) -> Result<String> {
    let mut buf = String::new();
    for line in lines {
        let json = serde_json::to_string(line)
            .map_err(|e| Error::Other(format!("serializing transcript line: {e}")))?;
        buf.push_str(&json);
        buf.push('\n');
    }
    Ok(buf)
}

/// Read and parse a JSONL transcript file.
fn read_jsonl_file(path: &Path, session_id: &str) -> Result<Vec<ChatMessage>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let mut lines = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChatMessage>(line) {
            Ok(msg) => lines.push(msg),
            Err(e) => {
                tracing::warn!(
                    session_id = session_id,
                    error = %e,
                    "skipping malformed transcript line"
                );
            }
        }
    }
    Ok(lines)
}
