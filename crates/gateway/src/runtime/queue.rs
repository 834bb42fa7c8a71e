//! FIFO job queue with blocking-with-timeout `put`/`get`.
//!
//! Multi-producer, multi-consumer.  A bounded queue makes `put` wait for
//! room; a closed queue refuses new jobs but keeps handing out the ones
//! already enqueued so workers can drain it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// An immutable queued unit of work.
#[derive(Debug)]
pub struct Job<T> {
    pub job_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub payload: T,
    /// Monotonic enqueue instant, used for wait-time metrics.
    pub(crate) enqueued: Instant,
}

impl<T> Job<T> {
    fn new(payload: T) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            payload,
            enqueued: Instant::now(),
        }
    }

    /// Time spent between `put` and now.
    pub fn waited(&self) -> Duration {
        self.enqueued.elapsed()
    }
}

pub type JobHandle<T> = Arc<Job<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is full")]
    Full,
    #[error("job queue is closed")]
    Closed,
}

struct QueueState<T> {
    items: VecDeque<JobHandle<T>>,
    closed: bool,
}

pub struct JobQueue<T> {
    state: Mutex<QueueState<T>>,
    /// `None` means unbounded.
    capacity: Option<usize>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> JobQueue<T> {
    /// `max_size == 0` builds an unbounded queue.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity: (max_size > 0).then_some(max_size),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue `payload`, waiting up to `timeout` for room.
    pub async fn put(&self, payload: T, timeout: Duration) -> Result<JobHandle<T>, QueueError> {
        let job = Arc::new(Job::new(payload));
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if self.capacity.map_or(true, |cap| state.items.len() < cap) {
                    state.items.push_back(job.clone());
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(job);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::Full);
            }
        }
    }

    /// Dequeue the oldest job, waiting up to `timeout`.
    ///
    /// `None` on timeout, or immediately once the queue is closed and
    /// empty.  Not an error: callers poll.
    pub async fn get(&self, timeout: Duration) -> Option<JobHandle<T>> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Refuse further `put`s and wake every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closed with nothing left to hand out.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }
}
