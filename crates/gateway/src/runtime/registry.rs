//! In-memory task state for accepted turns.
//!
//! One [`TaskState`] per `(session_id, request_id)`, created at submission,
//! advanced by the owning worker and read by status queries and relays.
//! Terminal states are kept for a while so late readers can still see the
//! outcome, then evicted by [`TaskRegistry::sweep`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tg_domain::trace::TraceEvent;
use tokio::time::Instant;

use super::error::EngineError;
use super::session_lock::SessionLockMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Streaming,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along `QUEUED → RUNNING → STREAMING → terminal`.
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Streaming => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Streaming => "STREAMING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serializes as the status-query response.
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub session_id: String,
    pub request_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "error_message", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Final content of a completed turn.
    #[serde(skip)]
    pub result: Option<String>,
    #[serde(skip)]
    last_accessed: Instant,
}

impl TaskState {
    pub fn result_view(&self) -> TaskResult {
        TaskResult {
            session_id: self.session_id.clone(),
            request_id: self.request_id.clone(),
            status: self.status,
            content: self.result.clone(),
            error_message: self.error.clone(),
        }
    }
}

/// Result-query response.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub session_id: String,
    pub request_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Optional fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub result: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl TaskUpdate {
    pub fn completed(content: impl Into<String>) -> Self {
        Self {
            result: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn failed(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_code: Some(code.to_owned()),
            ..Self::default()
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Terminal tasks past the result TTL.
    pub expired: usize,
    /// Terminal tasks evicted to get back under the cap.
    pub overflow: usize,
    pub remaining: usize,
    pub locks_reclaimed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub total: usize,
    /// Non-terminal tasks.
    pub active: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type TaskKey = (String, String);

struct Inner {
    tasks: HashMap<TaskKey, TaskState>,
    /// Last handed-out timestamp; stamps are strictly increasing.
    last_stamp: DateTime<Utc>,
}

impl Inner {
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + chrono::Duration::microseconds(1)
        };
        self.last_stamp = next;
        next
    }
}

pub struct TaskRegistry {
    inner: RwLock<Inner>,
    locks: Arc<SessionLockMap>,
    result_ttl: Duration,
    max_stored: usize,
    cleanup_interval: Duration,
    last_sweep: Mutex<Instant>,
}

fn key(session_id: &str, request_id: &str) -> TaskKey {
    (session_id.to_owned(), request_id.to_owned())
}

impl TaskRegistry {
    pub fn new(
        locks: Arc<SessionLockMap>,
        result_ttl: Duration,
        max_stored: usize,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                tasks: HashMap::new(),
                last_stamp: Utc::now(),
            }),
            locks,
            result_ttl,
            max_stored,
            cleanup_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Register a freshly accepted task as `QUEUED`.
    pub fn create(&self, session_id: &str, request_id: &str) -> TaskState {
        let mut inner = self.inner.write();
        let state = TaskState {
            session_id: session_id.to_owned(),
            request_id: request_id.to_owned(),
            status: TaskStatus::Queued,
            created_at: inner.stamp(),
            started_at: None,
            completed_at: None,
            error: None,
            error_code: None,
            result: None,
            last_accessed: Instant::now(),
        };
        inner.tasks.insert(key(session_id, request_id), state.clone());
        state
    }

    pub fn get(&self, session_id: &str, request_id: &str) -> Result<TaskState, EngineError> {
        self.inner
            .read()
            .tasks
            .get(&key(session_id, request_id))
            .cloned()
            .ok_or_else(|| EngineError::task_not_found(session_id, request_id))
    }

    /// Move a task forward.
    ///
    /// Returns `Ok(false)` without touching anything when the write would
    /// not advance the status (stale write, repeat, or task already
    /// terminal).  Timestamps are stamped under the registry lock.
    pub fn transition(
        &self,
        session_id: &str,
        request_id: &str,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, EngineError> {
        let k = key(session_id, request_id);
        let mut inner = self.inner.write();
        let current = inner
            .tasks
            .get(&k)
            .map(|t| t.status)
            .ok_or_else(|| EngineError::task_not_found(session_id, request_id))?;

        if current.is_terminal() || status.rank() <= current.rank() {
            tracing::debug!(
                session_id,
                request_id,
                current = current.as_str(),
                requested = status.as_str(),
                "ignored non-advancing task transition"
            );
            return Ok(false);
        }

        let now = inner.stamp();
        let Some(task) = inner.tasks.get_mut(&k) else {
            return Err(EngineError::task_not_found(session_id, request_id));
        };

        task.status = status;
        if task.started_at.is_none() && status.rank() >= TaskStatus::Running.rank() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        if update.result.is_some() {
            task.result = update.result;
        }
        if update.error.is_some() {
            task.error = update.error;
        }
        if update.error_code.is_some() {
            task.error_code = update.error_code;
        }
        task.last_accessed = Instant::now();
        Ok(true)
    }

    /// Refresh the last-access time.  Returns whether the task exists.
    pub fn touch(&self, session_id: &str, request_id: &str) -> bool {
        match self.inner.write().tasks.get_mut(&key(session_id, request_id)) {
            Some(task) => {
                task.last_accessed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Forget a task outright.  Used to roll back a rejected submission.
    pub fn remove(&self, session_id: &str, request_id: &str) -> Option<TaskState> {
        self.inner.write().tasks.remove(&key(session_id, request_id))
    }

    /// Tasks of one session, newest first.
    pub fn list(&self, session_id: &str) -> Vec<TaskState> {
        let inner = self.inner.read();
        let mut tasks: Vec<TaskState> = inner
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn counts(&self) -> TaskCounts {
        let inner = self.inner.read();
        TaskCounts {
            total: inner.tasks.len(),
            active: inner
                .tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .count(),
        }
    }

    /// Sweep if the cleanup interval has passed since the last one.
    pub fn sweep(&self) -> Option<SweepReport> {
        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() < self.cleanup_interval {
                return None;
            }
            *last = Instant::now();
        }
        Some(self.sweep_now())
    }

    /// Evict terminal tasks not accessed within the result TTL, then, while
    /// over the cap, the least recently accessed terminal tasks.
    /// Non-terminal tasks are never evicted.  Finally reclaims session
    /// locks of sessions with nothing left in flight.
    pub fn sweep_now(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let active_sessions: HashSet<String> = {
            let mut inner = self.inner.write();
            let before = inner.tasks.len();
            let ttl = self.result_ttl;
            inner
                .tasks
                .retain(|_, t| !(t.status.is_terminal() && t.last_accessed.elapsed() > ttl));
            report.expired = before - inner.tasks.len();

            if inner.tasks.len() > self.max_stored {
                let mut terminal: Vec<(Instant, TaskKey)> = inner
                    .tasks
                    .iter()
                    .filter(|(_, t)| t.status.is_terminal())
                    .map(|(k, t)| (t.last_accessed, k.clone()))
                    .collect();
                terminal.sort_by_key(|(accessed, _)| *accessed);

                let excess = inner.tasks.len() - self.max_stored;
                for (_, k) in terminal.into_iter().take(excess) {
                    inner.tasks.remove(&k);
                    report.overflow += 1;
                }
            }

            report.remaining = inner.tasks.len();
            inner
                .tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.session_id.clone())
                .collect()
        };

        report.locks_reclaimed = self
            .locks
            .reclaim(|session_id| active_sessions.contains(session_id));

        if report.expired + report.overflow + report.locks_reclaimed > 0 {
            TraceEvent::RegistrySwept {
                expired: report.expired,
                overflow: report.overflow,
                remaining: report.remaining,
                locks_reclaimed: report.locks_reclaimed,
            }
            .emit();
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ttl_ms: u64, max_stored: usize) -> TaskRegistry {
        TaskRegistry::new(
            Arc::new(SessionLockMap::new()),
            Duration::from_millis(ttl_ms),
            max_stored,
            Duration::from_secs(3600),
        )
    }

    // ── TaskStatus ──────────────────────────────────────────────────

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Streaming).unwrap();
        assert_eq!(json, "\"STREAMING\"");
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Streaming.is_terminal());
    }

    // ── Transitions ─────────────────────────────────────────────────

    #[test]
    fn happy_path_stamps_timestamps() {
        let reg = registry(60_000, 100);
        let created = reg.create("s", "r");
        assert_eq!(created.status, TaskStatus::Queued);

        assert!(reg.transition("s", "r", TaskStatus::Running, TaskUpdate::default()).unwrap());
        assert!(reg.transition("s", "r", TaskStatus::Streaming, TaskUpdate::default()).unwrap());
        assert!(reg
            .transition("s", "r", TaskStatus::Completed, TaskUpdate::completed("hi"))
            .unwrap());

        let task = reg.get("s", "r").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("hi"));
        let started = task.started_at.unwrap();
        let completed = task.completed_at.unwrap();
        assert!(started > task.created_at);
        assert!(completed > started);
    }

    #[test]
    fn stale_writes_are_ignored() {
        let reg = registry(60_000, 100);
        reg.create("s", "r");
        reg.transition("s", "r", TaskStatus::Streaming, TaskUpdate::default())
            .unwrap();

        assert!(!reg.transition("s", "r", TaskStatus::Queued, TaskUpdate::default()).unwrap());
        assert!(!reg.transition("s", "r", TaskStatus::Running, TaskUpdate::default()).unwrap());
        assert!(!reg.transition("s", "r", TaskStatus::Streaming, TaskUpdate::default()).unwrap());
        assert_eq!(reg.get("s", "r").unwrap().status, TaskStatus::Streaming);
    }

    #[test]
    fn terminal_state_is_final() {
        let reg = registry(60_000, 100);
        reg.create("s", "r");
        reg.transition("s", "r", TaskStatus::Failed, TaskUpdate::failed("CHAT_BACKEND_FAILED", "boom"))
            .unwrap();

        assert!(!reg
            .transition("s", "r", TaskStatus::Completed, TaskUpdate::completed("late"))
            .unwrap());
        let task = reg.get("s", "r").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.result.is_none());
        // Jumping straight to a terminal state still records a start.
        assert!(task.started_at.is_some());
    }

    #[test]
    fn unknown_task_is_not_found() {
        let reg = registry(60_000, 100);
        let err = reg.get("s", "missing").unwrap_err();
        assert_eq!(err.code(), "CHAT_TASK_NOT_FOUND");
        let err = reg
            .transition("s", "missing", TaskStatus::Running, TaskUpdate::default())
            .unwrap_err();
        assert_eq!(err.code(), "CHAT_TASK_NOT_FOUND");
        assert!(!reg.touch("s", "missing"));
    }

    #[test]
    fn remove_rolls_back() {
        let reg = registry(60_000, 100);
        reg.create("s", "r");
        assert!(reg.remove("s", "r").is_some());
        assert!(reg.get("s", "r").is_err());
        assert_eq!(reg.counts().total, 0);
    }

    #[test]
    fn status_view_uses_error_message() {
        let reg = registry(60_000, 100);
        reg.create("s", "r");
        reg.transition("s", "r", TaskStatus::Failed, TaskUpdate::failed("X", "nope"))
            .unwrap();
        let json = serde_json::to_value(reg.get("s", "r").unwrap()).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["error_message"], "nope");
        assert!(json.get("result").is_none());
        assert!(json.get("last_accessed").is_none());
    }

    #[test]
    fn list_is_newest_first() {
        let reg = registry(60_000, 100);
        reg.create("s", "r1");
        reg.create("s", "r2");
        reg.create("other", "r3");
        let ids: Vec<String> = reg.list("s").into_iter().map(|t| t.request_id).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }

    // ── Sweep ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn expired_terminal_tasks_are_evicted_but_active_ones_stay() {
        let reg = registry(30, 100);
        reg.create("s", "done");
        reg.transition("s", "done", TaskStatus::Completed, TaskUpdate::completed("x"))
            .unwrap();
        reg.create("s", "running");
        reg.transition("s", "running", TaskStatus::Running, TaskUpdate::default())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = reg.sweep_now();

        assert_eq!(report.expired, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(reg.get("s", "done").unwrap_err().code(), "CHAT_TASK_NOT_FOUND");
        assert_eq!(reg.get("s", "running").unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn touch_postpones_expiry() {
        let reg = registry(80, 100);
        reg.create("s", "r");
        reg.transition("s", "r", TaskStatus::Completed, TaskUpdate::completed("x"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reg.touch("s", "r"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(reg.sweep_now().expired, 0);
        assert!(reg.get("s", "r").is_ok());
    }

    #[tokio::test]
    async fn overflow_evicts_least_recently_accessed_terminal_tasks() {
        let reg = registry(60_000, 2);
        for rid in ["a", "b", "c"] {
            reg.create("s", rid);
            reg.transition("s", rid, TaskStatus::Completed, TaskUpdate::completed(rid))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        reg.create("s", "queued");
        // "a" was accessed last, so "b" and "c" are the oldest.
        reg.touch("s", "a");

        let report = reg.sweep_now();
        assert_eq!(report.overflow, 2);
        assert_eq!(report.remaining, 2);
        assert!(reg.get("s", "a").is_ok());
        assert!(reg.get("s", "queued").is_ok());
        assert!(reg.get("s", "b").is_err());
        assert!(reg.get("s", "c").is_err());
    }

    #[test]
    fn overflow_never_evicts_active_tasks() {
        let reg = registry(60_000, 1);
        for rid in ["a", "b", "c"] {
            reg.create("s", rid);
        }
        let report = reg.sweep_now();
        assert_eq!(report.overflow, 0);
        assert_eq!(reg.counts().active, 3);
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_session_locks() {
        let locks = Arc::new(SessionLockMap::new());
        let reg = TaskRegistry::new(
            locks.clone(),
            Duration::from_secs(60),
            100,
            Duration::from_secs(3600),
        );
        drop(locks.acquire("finished").await.unwrap());
        drop(locks.acquire("busy").await.unwrap());
        reg.create("busy", "r");

        let report = reg.sweep_now();
        assert_eq!(report.locks_reclaimed, 1);
        assert_eq!(locks.session_count(), 1);
    }

    #[test]
    fn sweep_is_time_gated() {
        let reg = registry(60_000, 100);
        assert!(reg.sweep().is_none());
    }
}
