//! Out-of-band commit of finished turns.
//!
//! Workers hand a [`TurnRecord`] to the stage and move on.  A single
//! consumer calls [`TurnStorage::append_turn`]; a failed attempt is
//! re-sent after a delay until the retry limit, then logged as data loss
//! and dropped.  Storage is idempotent on `request_id`, so a retry of a
//! commit that actually landed is harmless.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tg_domain::config::Backoff;
use tg_domain::trace::TraceEvent;
use tg_sessions::{TurnRecord, TurnStorage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::EngineError;

/// A turn waiting to be committed.
#[derive(Debug, Clone)]
pub struct PersistenceTask {
    pub record: TurnRecord,
    /// 0 for the first attempt.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub retry_limit: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => self.delay.saturating_mul(1u32 << attempt.min(16)),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    committed: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    /// Retries sent back but not yet picked up.
    scheduled: AtomicUsize,
}

/// Snapshot of the stage's counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PersistStats {
    pub committed: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub dropped: u64,
}

/// Cheap sender side handed to workers.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistenceTask>,
    counters: Arc<Counters>,
}

impl PersistenceHandle {
    /// Queue a finished turn.  Returns `false` if the stage has stopped.
    pub fn enqueue(&self, record: TurnRecord) -> bool {
        self.tx
            .send(PersistenceTask { record, attempt: 0 })
            .is_ok()
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            committed: self.counters.committed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct PersistenceStage {
    storage: Arc<dyn TurnStorage>,
    policy: RetryPolicy,
    tx: mpsc::UnboundedSender<PersistenceTask>,
    rx: mpsc::UnboundedReceiver<PersistenceTask>,
    counters: Arc<Counters>,
}

impl PersistenceStage {
    /// Start the consumer.  Cancelling `cancel` makes it drain what is
    /// queued (waiting up to `drain_grace` for scheduled retries) and exit.
    pub fn spawn(
        storage: Arc<dyn TurnStorage>,
        policy: RetryPolicy,
        cancel: CancellationToken,
        drain_grace: Duration,
    ) -> (PersistenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let handle = PersistenceHandle {
            tx: tx.clone(),
            counters: counters.clone(),
        };
        let stage = Self {
            storage,
            policy,
            tx,
            rx,
            counters,
        };
        let join = tokio::spawn(stage.run(cancel, drain_grace));
        (handle, join)
    }

    async fn run(mut self, cancel: CancellationToken, drain_grace: Duration) {
        loop {
            tokio::select! {
                biased;
                task = self.rx.recv() => match task {
                    Some(task) => self.process(task).await,
                    None => return,
                },
                _ = cancel.cancelled() => break,
            }
        }

        self.drain(drain_grace).await;
    }

    /// Commit everything still queued, including retries that come due
    /// within `grace`.
    async fn drain(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            while let Ok(task) = self.rx.try_recv() {
                self.process(task).await;
            }
            if self.counters.scheduled.load(Ordering::Acquire) == 0 {
                break;
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        pending = self.counters.scheduled.load(Ordering::Acquire),
                        "persistence drain grace elapsed with retries outstanding"
                    );
                    break;
                }
            }
        }
        tracing::debug!("persistence stage stopped");
    }

    async fn process(&self, task: PersistenceTask) {
        if task.attempt > 0 {
            self.counters.scheduled.fetch_sub(1, Ordering::AcqRel);
        }
        let record = &task.record;
        match self.storage.append_turn(record).await {
            Ok(committed) => {
                if committed {
                    self.counters.committed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        session_id = %record.session_id,
                        request_id = %record.request_id,
                        attempt = task.attempt,
                        "turn persisted"
                    );
                } else {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        session_id = %record.session_id,
                        request_id = %record.request_id,
                        "turn already persisted, skipping"
                    );
                }
                TraceEvent::TurnPersisted {
                    session_id: record.session_id.clone(),
                    request_id: record.request_id.clone(),
                    attempt: task.attempt,
                    committed,
                }
                .emit();
            }
            Err(e) if task.attempt >= self.policy.retry_limit => {
                let attempts = task.attempt + 1;
                let failure = EngineError::PersistenceFailure {
                    request_id: record.request_id.clone(),
                    attempts,
                    cause: e.to_string(),
                };
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    session_id = %record.session_id,
                    request_id = %record.request_id,
                    attempts,
                    code = failure.code(),
                    error = %failure,
                    "turn dropped, data loss"
                );
                TraceEvent::PersistenceDropped {
                    session_id: record.session_id.clone(),
                    request_id: record.request_id.clone(),
                    attempts,
                    cause: e.to_string(),
                }
                .emit();
            }
            Err(e) => {
                let delay = self.policy.delay_for(task.attempt);
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session_id = %record.session_id,
                    request_id = %record.request_id,
                    attempt = task.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "turn persistence failed, will retry"
                );
                self.schedule_retry(
                    PersistenceTask {
                        record: task.record,
                        attempt: task.attempt + 1,
                    },
                    delay,
                );
            }
        }
    }

    fn schedule_retry(&self, task: PersistenceTask, delay: Duration) {
        let tx = self.tx.clone();
        let counters = self.counters.clone();
        counters.scheduled.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(task).is_err() {
                counters.scheduled.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!("persistence stage gone, retry discarded");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tg_domain::error::{Error, Result};
    use tg_domain::message::ChatMessage;
    use tg_sessions::{MemoryStorage, SessionEntry};

    /// Fails the first `failures` appends, then delegates.
    struct Flaky {
        inner: MemoryStorage,
        failures: Mutex<u32>,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            let inner = MemoryStorage::new();
            inner.insert_session("s");
            Arc::new(Self {
                inner,
                failures: Mutex::new(failures),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl TurnStorage for Flaky {
        async fn create_session(&self, title: Option<String>) -> Result<SessionEntry> {
            self.inner.create_session(title).await
        }
        async fn session_exists(&self, session_id: &str) -> Result<bool> {
            self.inner.session_exists(session_id).await
        }
        async fn get_session(&self, session_id: &str) -> Result<Option<SessionEntry>> {
            self.inner.get_session(session_id).await
        }
        async fn list_sessions(&self) -> Result<Vec<SessionEntry>> {
            self.inner.list_sessions().await
        }
        async fn delete_session(&self, session_id: &str) -> Result<bool> {
            self.inner.delete_session(session_id).await
        }
        async fn append_turn(&self, turn: &TurnRecord) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut left = self.failures.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::Storage("transient".into()));
                }
            }
            self.inner.append_turn(turn).await
        }
        async fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
            self.inner.load_recent(session_id, limit).await
        }
    }

    fn record(request_id: &str) -> TurnRecord {
        TurnRecord {
            session_id: "s".into(),
            request_id: request_id.into(),
            user_message: "hi".into(),
            content: "hello".into(),
            metadata: None,
        }
    }

    fn policy(retry_limit: u32) -> RetryPolicy {
        RetryPolicy {
            retry_limit,
            delay: Duration::from_millis(5),
            backoff: Backoff::Fixed,
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let p = RetryPolicy {
            retry_limit: 3,
            delay: Duration::from_millis(100),
            backoff: Backoff::Exponential,
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy(3).delay_for(3), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_committed() {
        let storage = Flaky::new(2);
        let (handle, _join) = PersistenceStage::spawn(
            storage.clone(),
            policy(2),
            CancellationToken::new(),
            Duration::from_secs(1),
        );
        assert!(handle.enqueue(record("r1")));

        wait_for(|| handle.stats().committed == 1).await;
        assert_eq!(storage.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.stats().retried, 2);
        assert_eq!(storage.inner.turn_count("s"), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_turn() {
        let storage = Flaky::new(10);
        let (handle, _join) = PersistenceStage::spawn(
            storage.clone(),
            policy(1),
            CancellationToken::new(),
            Duration::from_secs(1),
        );
        handle.enqueue(record("r1"));

        wait_for(|| handle.stats().dropped == 1).await;
        assert_eq!(storage.calls.load(Ordering::SeqCst), 2);
        assert_eq!(storage.inner.turn_count("s"), 0);
    }

    #[tokio::test]
    async fn duplicate_request_ids_commit_once() {
        let storage = Flaky::new(0);
        let (handle, _join) = PersistenceStage::spawn(
            storage.clone(),
            policy(0),
            CancellationToken::new(),
            Duration::from_secs(1),
        );
        handle.enqueue(record("same"));
        handle.enqueue(record("same"));

        wait_for(|| handle.stats().duplicates == 1).await;
        assert_eq!(handle.stats().committed, 1);
        assert_eq!(storage.inner.turn_count("s"), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_retries() {
        let storage = Flaky::new(1);
        let cancel = CancellationToken::new();
        let (handle, join) = PersistenceStage::spawn(
            storage.clone(),
            RetryPolicy {
                retry_limit: 2,
                delay: Duration::from_millis(50),
                backoff: Backoff::Fixed,
            },
            cancel.clone(),
            Duration::from_secs(1),
        );
        handle.enqueue(record("r1"));
        wait_for(|| handle.stats().retried == 1).await;

        cancel.cancel();
        join.await.unwrap();
        assert_eq!(handle.stats().committed, 1);
    }
}
