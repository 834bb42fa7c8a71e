use serde::Serialize;

/// Structured trace events emitted across all TurnGate crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
    },
    SessionDeleted {
        session_id: String,
    },
    TaskQueued {
        session_id: String,
        request_id: String,
        queue_depth: usize,
    },
    TaskStarted {
        session_id: String,
        request_id: String,
        waited_ms: u64,
    },
    TaskFinished {
        session_id: String,
        request_id: String,
        status: String,
        token_count: usize,
        duration_ms: u64,
    },
    StreamClosed {
        session_id: String,
        request_id: String,
        terminal: String,
        frames: usize,
        elapsed_ms: u64,
    },
    TurnPersisted {
        session_id: String,
        request_id: String,
        attempt: u32,
        committed: bool,
    },
    PersistenceDropped {
        session_id: String,
        request_id: String,
        attempts: u32,
        cause: String,
    },
    TranscriptAppend {
        session_id: String,
        lines: usize,
    },
    RegistrySwept {
        expired: usize,
        overflow: usize,
        remaining: usize,
        locks_reclaimed: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "tg_event");
    }
}
