//! The turn engine: one explicit handle over queue, workers, buffer,
//! registry, relay and persistence, built once at process start.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tg_domain::config::{Backoff, RuntimeConfig, MAX_CONTEXT_WINDOW};
use tg_domain::message::ChatMessage;
use tg_domain::stream::BoxStream;
use tg_domain::trace::TraceEvent;
use tg_providers::Backend;
use tg_sessions::{SessionEntry, TurnStorage};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::EngineError;
use super::event_buffer::EventBuffer;
use super::persist::{PersistStats, PersistenceHandle, PersistenceStage, RetryPolicy};
use super::queue::JobQueue;
use super::registry::{TaskCounts, TaskRegistry, TaskResult, TaskState, TaskStatus};
use super::relay::{StreamFrame, StreamRelay};
use super::session_lock::SessionLockMap;
use super::worker::{TurnPayload, WorkerContext, WorkerPool};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolved engine knobs.  Built from [`RuntimeConfig`] in production;
/// tests fill it in directly with short durations.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 0 = unbounded.
    pub queue_max_size: usize,
    pub queue_poll_timeout: Duration,
    pub queue_put_timeout: Duration,
    pub worker_count: usize,
    /// 0 = unbounded.
    pub buffer_max_chunks: usize,
    pub buffer_idle_ttl: Duration,
    pub buffer_push_timeout: Duration,
    pub relay_poll_timeout: Duration,
    pub task_result_ttl: Duration,
    pub max_stored_tasks: usize,
    pub cleanup_interval: Duration,
    pub stream_timeout: Duration,
    pub persist_retry_limit: u32,
    pub persist_retry_delay: Duration,
    pub persist_backoff: Backoff,
    pub default_context_window: usize,
    /// How long shutdown waits for queued and running turns.
    pub shutdown_grace: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        let cfg = cfg.clamped();
        Self {
            queue_max_size: cfg.queue.max_size,
            queue_poll_timeout: cfg.queue.poll_timeout(),
            queue_put_timeout: cfg.queue.put_timeout(),
            worker_count: cfg.workers.pool_size,
            buffer_max_chunks: cfg.event_buffer.max_chunks,
            buffer_idle_ttl: Duration::from_secs(cfg.event_buffer.idle_ttl_secs),
            buffer_push_timeout: Duration::from_millis(cfg.event_buffer.push_timeout_ms),
            relay_poll_timeout: Duration::from_millis(cfg.event_buffer.poll_timeout_ms),
            task_result_ttl: Duration::from_secs(cfg.tasks.result_ttl_secs),
            max_stored_tasks: cfg.tasks.max_stored,
            cleanup_interval: Duration::from_secs(cfg.tasks.cleanup_interval_secs),
            stream_timeout: Duration::from_secs(cfg.stream.timeout_secs),
            persist_retry_limit: cfg.persistence.retry_limit,
            persist_retry_delay: Duration::from_millis(cfg.persistence.retry_delay_ms),
            persist_backoff: cfg.persistence.backoff,
            default_context_window: cfg.history.default_context_window,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Submission types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    /// Omitted: a new session is created.
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_query: String,
    #[serde(default)]
    pub context_window: Option<usize>,
}

impl SubmitRequest {
    pub fn new(session_id: Option<String>, user_query: impl Into<String>) -> Self {
        Self {
            session_id,
            user_query: user_query.into(),
            context_window: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub session_id: String,
    pub request_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub queue_depth: usize,
    pub workers: usize,
    pub tasks: TaskCounts,
    pub buckets: usize,
    pub session_locks: usize,
    pub persistence: PersistStats,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnEngine {
    settings: EngineSettings,
    queue: Arc<JobQueue<TurnPayload>>,
    buffer: Arc<EventBuffer>,
    registry: Arc<TaskRegistry>,
    locks: Arc<SessionLockMap>,
    storage: Arc<dyn TurnStorage>,
    relay: StreamRelay,
    persist: PersistenceHandle,
    worker_count: usize,
    workers: Mutex<Option<WorkerPool>>,
    persist_task: Mutex<Option<JoinHandle<()>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    /// Stops workers and the janitor.
    cancel: CancellationToken,
    /// Stops the persistence stage, after the workers.
    persist_cancel: CancellationToken,
}

impl TurnEngine {
    /// Build the engine and spawn its background tasks.  Must be called
    /// from within a Tokio runtime.
    pub fn start(
        settings: EngineSettings,
        backend: Arc<dyn Backend>,
        storage: Arc<dyn TurnStorage>,
    ) -> Arc<Self> {
        let locks = Arc::new(SessionLockMap::new());
        let registry = Arc::new(TaskRegistry::new(
            locks.clone(),
            settings.task_result_ttl,
            settings.max_stored_tasks,
            settings.cleanup_interval,
        ));
        let queue = Arc::new(JobQueue::new(settings.queue_max_size));
        let buffer = Arc::new(EventBuffer::new(
            settings.buffer_max_chunks,
            settings.buffer_idle_ttl,
            settings.buffer_push_timeout,
        ));
        let relay = StreamRelay::new(
            buffer.clone(),
            registry.clone(),
            settings.stream_timeout,
            settings.relay_poll_timeout,
        );

        let cancel = CancellationToken::new();
        let persist_cancel = CancellationToken::new();
        let (persist, persist_task) = PersistenceStage::spawn(
            storage.clone(),
            RetryPolicy {
                retry_limit: settings.persist_retry_limit,
                delay: settings.persist_retry_delay,
                backoff: settings.persist_backoff,
            },
            persist_cancel.clone(),
            settings.shutdown_grace,
        );

        let worker_count = settings.worker_count.max(1);
        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            buffer: buffer.clone(),
            registry: registry.clone(),
            locks: locks.clone(),
            backend,
            storage: storage.clone(),
            persist: persist.clone(),
            poll_timeout: settings.queue_poll_timeout,
        });
        let workers = WorkerPool::spawn(worker_count, ctx, cancel.clone());
        let janitor = spawn_janitor(
            registry.clone(),
            buffer.clone(),
            settings.cleanup_interval,
            cancel.clone(),
        );

        Arc::new(Self {
            settings,
            queue,
            buffer,
            registry,
            locks,
            storage,
            relay,
            persist,
            worker_count,
            workers: Mutex::new(Some(workers)),
            persist_task: Mutex::new(Some(persist_task)),
            janitor: Mutex::new(Some(janitor)),
            cancel,
            persist_cancel,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Accept a turn.  Creates the session when none is given.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitReceipt, EngineError> {
        let user_query = req.user_query.trim();
        if user_query.is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        let session_id = match req.session_id {
            Some(session_id) => {
                if !self.storage.session_exists(&session_id).await? {
                    return Err(EngineError::SessionNotFound { session_id });
                }
                session_id
            }
            None => self.create_session(None).await?.session_id,
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let context_window = req
            .context_window
            .unwrap_or(self.settings.default_context_window)
            .min(MAX_CONTEXT_WINDOW);

        self.registry.create(&session_id, &request_id);
        let payload = TurnPayload {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            user_query: user_query.to_owned(),
            context_window,
        };

        if let Err(e) = self.queue.put(payload, self.settings.queue_put_timeout).await {
            self.registry.remove(&session_id, &request_id);
            tracing::warn!(
                session_id = %session_id,
                request_id = %request_id,
                error = %e,
                "turn submission rejected"
            );
            return Err(EngineError::SubmissionRejected(e));
        }

        TraceEvent::TaskQueued {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            queue_depth: self.queue.size(),
        }
        .emit();

        Ok(SubmitReceipt {
            session_id,
            request_id,
            status: TaskStatus::Queued,
        })
    }

    /// Open the event stream of an accepted turn.
    pub fn stream(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<BoxStream<'static, StreamFrame>, EngineError> {
        self.registry.get(session_id, request_id)?;
        Ok(self.relay.open(session_id, request_id))
    }

    pub fn status(&self, session_id: &str, request_id: &str) -> Result<TaskState, EngineError> {
        self.registry.touch(session_id, request_id);
        self.registry.get(session_id, request_id)
    }

    pub fn result(&self, session_id: &str, request_id: &str) -> Result<TaskResult, EngineError> {
        self.status(session_id, request_id).map(|t| t.result_view())
    }

    /// Tasks of one session still held by the registry, newest first.
    pub fn tasks(&self, session_id: &str) -> Vec<TaskState> {
        self.registry.list(session_id)
    }

    pub async fn create_session(&self, title: Option<String>) -> Result<SessionEntry, EngineError> {
        Ok(self.storage.create_session(title).await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionEntry>, EngineError> {
        Ok(self.storage.list_sessions().await?)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), EngineError> {
        if self.storage.delete_session(session_id).await? {
            Ok(())
        } else {
            Err(EngineError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
        }
    }

    /// The last `limit` committed messages, oldest first.
    pub async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        if !self.storage.session_exists(session_id).await? {
            return Err(EngineError::SessionNotFound {
                session_id: session_id.to_owned(),
            });
        }
        Ok(self.storage.load_recent(session_id, limit).await?)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queue_depth: self.queue.size(),
            workers: self.worker_count,
            tasks: self.registry.counts(),
            buckets: self.buffer.bucket_count(),
            session_locks: self.locks.session_count(),
            persistence: self.persist.stats(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Stop accepting, let queued and running turns finish (up to the
    /// grace period), then drain persistence and flush storage.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let workers = self.workers.lock().take();
        let Some(workers) = workers else {
            return;
        };
        tracing::info!(queued = self.queue.size(), "turn engine shutting down");

        self.queue.close();
        workers
            .shutdown(&self.cancel, self.settings.shutdown_grace)
            .await;

        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            let _ = janitor.await;
        }

        self.persist_cancel.cancel();
        let persist_task = self.persist_task.lock().take();
        if let Some(task) = persist_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "persistence stage ended abnormally");
            }
        }

        if let Err(e) = self.storage.flush().await {
            tracing::warn!(error = %e, "storage flush on shutdown failed");
        }
        tracing::info!("turn engine stopped");
    }
}

/// Periodic registry sweep and idle-bucket reclamation.
fn spawn_janitor(
    registry: Arc<TaskRegistry>,
    buffer: Arc<EventBuffer>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    registry.sweep();
                    buffer.sweep_idle();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_clamped_config() {
        let mut cfg = RuntimeConfig::default();
        cfg.queue.poll_timeout_ms = 1;
        cfg.tasks.result_ttl_secs = 5;
        cfg.history.default_context_window = 500;
        cfg.workers.pool_size = 3;

        let s = EngineSettings::from_config(&cfg);
        assert_eq!(s.queue_poll_timeout, Duration::from_millis(10));
        assert_eq!(s.task_result_ttl, Duration::from_secs(60));
        assert_eq!(s.default_context_window, MAX_CONTEXT_WINDOW);
        assert_eq!(s.worker_count, 3);
        assert_eq!(s.stream_timeout, Duration::from_secs(180));
    }

    #[test]
    fn submit_request_fields_are_optional() {
        let req: SubmitRequest = serde_json::from_str(r#"{"user_query":"hi"}"#).unwrap();
        assert!(req.session_id.is_none());
        assert!(req.context_window.is_none());
    }
}
