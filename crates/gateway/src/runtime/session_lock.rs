//! Per-session mutual exclusion.
//!
//! Only one turn runs per session at a time.  A worker that dequeues a job
//! for a busy session waits here until the running turn releases its
//! permit; other sessions are unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Manages per-session run locks.
///
/// Each session maps to a `Semaphore(1)`, created on first use.  The
/// permit auto-releases on drop, so a worker that errors or panics never
/// leaves its session locked.
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the run lock for a session, waiting for the current holder.
    pub async fn acquire(&self, session_id: &str) -> Result<OwnedSemaphorePermit, LockClosed> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        sem.acquire_owned().await.map_err(|_| LockClosed)
    }

    /// Whether a session's lock is currently held.
    pub fn is_held(&self, session_id: &str) -> bool {
        self.locks
            .lock()
            .get(session_id)
            .is_some_and(|sem| sem.available_permits() == 0)
    }

    /// Number of tracked sessions (for monitoring).
    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop locks that are free, have no waiter and belong to a session
    /// `is_active` reports as idle.  Returns the number removed.
    pub fn reclaim<F>(&self, is_active: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|session_id, sem| {
            // The map holds one reference; any other means a worker is
            // holding or about to wait on it.
            let in_use = Arc::strong_count(sem) > 1 || sem.available_permits() == 0;
            in_use || is_active(session_id)
        });
        before - locks.len()
    }
}

/// The session semaphore was closed.  Never happens in normal operation.
#[derive(Debug)]
pub struct LockClosed;

impl std::fmt::Display for LockClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session lock closed")
    }
}

impl std::error::Error for LockClosed {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_access() {
        let map = SessionLockMap::new();

        let permit1 = map.acquire("s1").await.unwrap();
        assert!(map.is_held("s1"));
        drop(permit1);
        assert!(!map.is_held("s1"));

        let permit2 = map.acquire("s1").await.unwrap();
        drop(permit2);
    }

    #[tokio::test]
    async fn different_sessions_concurrent() {
        let map = Arc::new(SessionLockMap::new());

        let p1 = map.acquire("s1").await.unwrap();
        let p2 = map.acquire("s2").await.unwrap();

        // Both acquired simultaneously.
        assert_eq!(map.session_count(), 2);

        drop(p1);
        drop(p2);
    }

    #[tokio::test]
    async fn same_session_waits() {
        let map = Arc::new(SessionLockMap::new());
        let map2 = map.clone();

        let p1 = map.acquire("s1").await.unwrap();

        let handle = tokio::spawn(async move {
            let _p2 = map2.acquire("s1").await.unwrap();
            42
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(p1);

        let result = handle.await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn reclaim_keeps_held_and_active_locks() {
        let map = SessionLockMap::new();
        let held = map.acquire("held").await.unwrap();
        drop(map.acquire("active").await.unwrap());
        drop(map.acquire("idle").await.unwrap());

        let removed = map.reclaim(|sid| sid == "active");
        assert_eq!(removed, 1);
        assert_eq!(map.session_count(), 2);

        drop(held);
        assert_eq!(map.reclaim(|_| false), 2);
        assert_eq!(map.session_count(), 0);
    }

    #[tokio::test]
    async fn reclaim_keeps_lock_with_a_waiter() {
        let map = Arc::new(SessionLockMap::new());
        let p1 = map.acquire("s1").await.unwrap();

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move {
                let _p = map.acquire("s1").await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(map.reclaim(|_| false), 0);

        drop(p1);
        waiter.await.unwrap();
        assert_eq!(map.reclaim(|_| false), 1);
    }
}
