//! Keyed event mailbox between workers and stream relays.
//!
//! One independent FIFO ("bucket") per `(session_id, request_id)`.
//! Buckets are created on first `push` or `pop` and go away on
//! [`EventBuffer::cleanup`] or after sitting idle past the TTL.  A bounded
//! bucket makes `push` wait, which is how a slow or absent consumer
//! throttles the producing worker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::events::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// No room freed up within the push timeout.
    #[error("event bucket is full")]
    Full,
    /// The bucket was cleaned up while the producer held it.
    #[error("event bucket is closed")]
    Closed,
}

type BucketKey = (String, String);

struct BucketState {
    events: VecDeque<StreamEvent>,
    closed: bool,
    touched: Instant,
}

struct Bucket {
    state: Mutex<BucketState>,
    readable: Notify,
    writable: Notify,
}

impl Bucket {
    fn new() -> Self {
        Self {
            state: Mutex::new(BucketState {
                events: VecDeque::new(),
                closed: false,
                touched: Instant::now(),
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

pub struct EventBuffer {
    buckets: Mutex<HashMap<BucketKey, Arc<Bucket>>>,
    /// Per-bucket capacity; `None` means unbounded.
    capacity: Option<usize>,
    idle_ttl: Duration,
    push_timeout: Duration,
}

impl EventBuffer {
    /// `max_chunks == 0` builds unbounded buckets.
    pub fn new(max_chunks: usize, idle_ttl: Duration, push_timeout: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: (max_chunks > 0).then_some(max_chunks),
            idle_ttl,
            push_timeout,
        }
    }

    fn bucket(&self, session_id: &str, request_id: &str) -> Arc<Bucket> {
        self.buckets
            .lock()
            .entry((session_id.to_owned(), request_id.to_owned()))
            .or_insert_with(|| Arc::new(Bucket::new()))
            .clone()
    }

    /// Append an event, waiting up to the push timeout for room.
    pub async fn push(
        &self,
        session_id: &str,
        request_id: &str,
        event: StreamEvent,
    ) -> Result<(), PushError> {
        let bucket = self.bucket(session_id, request_id);
        let deadline = Instant::now() + self.push_timeout;

        loop {
            let notified = bucket.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = bucket.state.lock();
                if state.closed {
                    return Err(PushError::Closed);
                }
                if self.capacity.map_or(true, |cap| state.events.len() < cap) {
                    state.events.push_back(event);
                    state.touched = Instant::now();
                    drop(state);
                    bucket.readable.notify_one();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PushError::Full);
            }
        }
    }

    /// Take the oldest event of a bucket, waiting up to `timeout`.
    pub async fn pop(
        &self,
        session_id: &str,
        request_id: &str,
        timeout: Duration,
    ) -> Option<StreamEvent> {
        let bucket = self.bucket(session_id, request_id);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = bucket.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = bucket.state.lock();
                state.touched = Instant::now();
                if let Some(event) = state.events.pop_front() {
                    drop(state);
                    bucket.writable.notify_one();
                    return Some(event);
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

    /// Drop a bucket and its pending events.  Producers blocked on it get
    /// [`PushError::Closed`]; a later `push` or `pop` starts a fresh bucket.
    pub fn cleanup(&self, session_id: &str, request_id: &str) {
        let removed = self
            .buckets
            .lock()
            .remove(&(session_id.to_owned(), request_id.to_owned()));
        if let Some(bucket) = removed {
            bucket.close();
        }
    }

    /// Pending events in a bucket (0 if it does not exist).
    pub fn size(&self, session_id: &str, request_id: &str) -> usize {
        self.buckets
            .lock()
            .get(&(session_id.to_owned(), request_id.to_owned()))
            .map_or(0, |b| b.state.lock().events.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Reclaim buckets nobody has pushed to or popped from within the
    /// idle TTL.  Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let expired: Vec<Arc<Bucket>> = {
            let mut buckets = self.buckets.lock();
            let keys: Vec<BucketKey> = buckets
                .iter()
                .filter(|(_, b)| b.state.lock().touched.elapsed() > self.idle_ttl)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| buckets.remove(k)).collect()
        };

        for bucket in &expired {
            bucket.close();
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "reclaimed idle event buckets");
        }
        expired.len()
    }
}
