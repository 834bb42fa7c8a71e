use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn runtime configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the turn engine needs, built once at process start.
///
/// Every sub-section has a `clamped()` that pins values into the range the
/// engine accepts; the engine only ever sees clamped values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub event_buffer: EventBufferConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl RuntimeConfig {
    pub fn clamped(&self) -> Self {
        Self {
            queue: self.queue.clamped(),
            workers: self.workers.clamped(),
            event_buffer: self.event_buffer.clamped(),
            tasks: self.tasks.clamped(),
            stream: self.stream.clamped(),
            persistence: self.persistence.clone(),
            history: self.history.clamped(),
        }
    }
}

// ── Job queue ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued jobs.  `0` means unbounded.
    #[serde(default = "d_queue_max_size")]
    pub max_size: usize,
    /// How long a worker waits on an empty queue before re-checking for
    /// shutdown.
    #[serde(default = "d_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// How long a submission waits for room in a full queue.
    #[serde(default = "d_put_timeout_ms")]
    pub put_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: d_queue_max_size(),
            poll_timeout_ms: d_poll_timeout_ms(),
            put_timeout_ms: d_put_timeout_ms(),
        }
    }
}

impl QueueConfig {
    pub fn clamped(&self) -> Self {
        Self {
            max_size: self.max_size,
            poll_timeout_ms: self.poll_timeout_ms.max(10),
            put_timeout_ms: self.put_timeout_ms,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }
}

// ── Worker pool ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.  `0` picks `max(4, cpus * 4)`.
    #[serde(default)]
    pub pool_size: usize,
}

impl WorkerConfig {
    pub fn clamped(&self) -> Self {
        Self {
            pool_size: self.effective_pool_size(),
        }
    }

    /// Resolved pool size, in `1..=512`.
    pub fn effective_pool_size(&self) -> usize {
        let size = if self.pool_size == 0 {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (cpus * 4).max(4)
        } else {
            self.pool_size
        };
        size.clamp(1, 512)
    }
}

// ── Event buffer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBufferConfig {
    /// Per-bucket capacity.  `0` means unbounded (no backpressure).
    #[serde(default = "d_max_chunks")]
    pub max_chunks: usize,
    /// Buckets untouched for this long are reclaimed.
    #[serde(default = "d_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// How long a producer blocks on a full bucket before dropping the event.
    #[serde(default = "d_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// Relay poll interval.
    #[serde(default = "d_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            max_chunks: d_max_chunks(),
            idle_ttl_secs: d_idle_ttl_secs(),
            push_timeout_ms: d_push_timeout_ms(),
            poll_timeout_ms: d_poll_timeout_ms(),
        }
    }
}

impl EventBufferConfig {
    pub fn clamped(&self) -> Self {
        Self {
            max_chunks: self.max_chunks,
            idle_ttl_secs: self.idle_ttl_secs.max(1),
            push_timeout_ms: self.push_timeout_ms,
            poll_timeout_ms: self.poll_timeout_ms.max(10),
        }
    }
}

// ── Task registry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Terminal tasks not accessed for this long are evicted.  Min 60.
    #[serde(default = "d_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// Upper bound on stored tasks.  Only terminal tasks are evicted to
    /// honour it.  Min 100.
    #[serde(default = "d_max_stored")]
    pub max_stored: usize,
    /// Minimum spacing between sweeps.  Min 5.
    #[serde(default = "d_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: d_result_ttl_secs(),
            max_stored: d_max_stored(),
            cleanup_interval_secs: d_cleanup_interval_secs(),
        }
    }
}

impl TaskConfig {
    pub fn clamped(&self) -> Self {
        Self {
            result_ttl_secs: self.result_ttl_secs.max(60),
            max_stored: self.max_stored.max(100),
            cleanup_interval_secs: self.cleanup_interval_secs.max(5),
        }
    }
}

// ── Stream relay ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Overall budget for one relay call, from open to terminal frame.
    #[serde(default = "d_stream_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: d_stream_timeout_secs(),
        }
    }
}

impl StreamConfig {
    pub fn clamped(&self) -> Self {
        Self {
            timeout_secs: self.timeout_secs.max(1),
        }
    }
}

// ── Persistence ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Retries after the first failed attempt.
    #[serde(default = "d_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "d_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_limit: d_retry_limit(),
            retry_delay_ms: d_retry_delay_ms(),
            backoff: Backoff::default(),
        }
    }
}

// ── History ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages of history handed to the backend when a submission does
    /// not say.  Clamped to `MAX_CONTEXT_WINDOW`.
    #[serde(default = "d_context_window")]
    pub default_context_window: usize,
}

pub const MAX_CONTEXT_WINDOW: usize = 100;

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_context_window: d_context_window(),
        }
    }
}

impl HistoryConfig {
    pub fn clamped(&self) -> Self {
        Self {
            default_context_window: self.default_context_window.min(MAX_CONTEXT_WINDOW),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_queue_max_size() -> usize {
    1000
}
fn d_poll_timeout_ms() -> u64 {
    200
}
fn d_put_timeout_ms() -> u64 {
    1000
}
fn d_max_chunks() -> usize {
    4096
}
fn d_idle_ttl_secs() -> u64 {
    600
}
fn d_push_timeout_ms() -> u64 {
    30_000
}
fn d_result_ttl_secs() -> u64 {
    1800
}
fn d_max_stored() -> usize {
    10_000
}
fn d_cleanup_interval_secs() -> u64 {
    30
}
fn d_stream_timeout_secs() -> u64 {
    180
}
fn d_retry_limit() -> u32 {
    2
}
fn d_retry_delay_ms() -> u64 {
    500
}
fn d_context_window() -> usize {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
