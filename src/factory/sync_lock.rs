//! Per-project cooperative lock between pipelines and the sync scheduler.
//!
//! Worker acquisitions are shared; a sync acquisition is exclusive and is
//! granted only once no worker holds the lock. Waiters are served in
//! `(priority desc, request order asc)` order and a waiting sync blocks
//! every waiter queued behind it, so a steady stream of workers cannot
//! starve the scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::oneshot;

pub const DEFAULT_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Worker,
    Sync,
}

struct Waiter {
    id: u64,
    kind: LockKind,
    priority: i32,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    workers: usize,
    sync_held: bool,
    /// Kept sorted by (priority desc, id asc); ids are monotonic.
    queue: Vec<Waiter>,
    next_id: u64,
}

impl LockState {
    fn grant(&mut self, kind: LockKind) {
        match kind {
            LockKind::Worker => self.workers += 1,
            LockKind::Sync => self.sync_held = true,
        }
    }

    /// Grant queued requests in order until one cannot be served.
    fn dispatch(&mut self) {
        while let Some(head) = self.queue.first() {
            let grantable = match head.kind {
                LockKind::Worker => !self.sync_held,
                LockKind::Sync => !self.sync_held && self.workers == 0,
            };
            if !grantable {
                break;
            }
            let waiter = self.queue.remove(0);
            self.grant(waiter.kind);
            // A dropped receiver is handled by `Pending::drop`, which sees
            // the request is no longer queued and releases the grant.
            let _ = waiter.tx.send(());
        }
    }

    fn enqueue(&mut self, kind: LockKind, priority: i32) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        let pos = self
            .queue
            .iter()
            .position(|w| w.priority < priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(
            pos,
            Waiter {
                id,
                kind,
                priority,
                tx,
            },
        );
        (id, rx)
    }
}

/// Point-in-time view of a lock, for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    pub project_id: i64,
    pub workers: usize,
    pub sync_held: bool,
    pub waiting_workers: usize,
    pub waiting_syncs: usize,
}

pub struct SyncLock {
    project_id: i64,
    state: Mutex<LockState>,
}

impl SyncLock {
    pub fn new(project_id: i64) -> Arc<Self> {
        Arc::new(Self {
            project_id,
            state: Mutex::new(LockState::default()),
        })
    }

    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // The state is plain counters; a panic while holding it cannot
        // leave it half-updated, so poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn acquire_worker(self: &Arc<Self>, priority: i32) -> WorkerGuard {
        self.acquire(LockKind::Worker, priority).await;
        WorkerGuard { lock: self.clone() }
    }

    pub async fn acquire_sync(self: &Arc<Self>, priority: i32) -> SyncGuard {
        self.acquire(LockKind::Sync, priority).await;
        SyncGuard { lock: self.clone() }
    }

    /// Non-blocking: succeeds only if nothing is queued and no sync holds the lock.
    pub fn try_acquire_worker(self: &Arc<Self>) -> Option<WorkerGuard> {
        let mut state = self.state();
        if state.sync_held || !state.queue.is_empty() {
            return None;
        }
        state.grant(LockKind::Worker);
        Some(WorkerGuard { lock: self.clone() })
    }

    /// Non-blocking: succeeds only if the lock is completely free.
    pub fn try_acquire_sync(self: &Arc<Self>) -> Option<SyncGuard> {
        let mut state = self.state();
        if state.sync_held || state.workers > 0 || !state.queue.is_empty() {
            return None;
        }
        state.grant(LockKind::Sync);
        Some(SyncGuard { lock: self.clone() })
    }

    /// Run `f` while holding a shared worker lock. The lock is released
    /// when `f` finishes, errors, or the returned future is dropped.
    pub async fn with_worker_lock<F, Fut, T>(self: &Arc<Self>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire_worker(DEFAULT_PRIORITY).await;
        f().await
    }

    /// Run `f` while holding the exclusive sync lock.
    pub async fn with_sync_lock<F, Fut, T>(self: &Arc<Self>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire_sync(DEFAULT_PRIORITY).await;
        f().await
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state();
        LockSnapshot {
            project_id: self.project_id,
            workers: state.workers,
            sync_held: state.sync_held,
            waiting_workers: state
                .queue
                .iter()
                .filter(|w| w.kind == LockKind::Worker)
                .count(),
            waiting_syncs: state
                .queue
                .iter()
                .filter(|w| w.kind == LockKind::Sync)
                .count(),
        }
    }

    async fn acquire(self: &Arc<Self>, kind: LockKind, priority: i32) {
        let (id, rx) = {
            let mut state = self.state();
            let ticket = state.enqueue(kind, priority);
            state.dispatch();
            ticket
        };
        let mut pending = Pending {
            lock: self.clone(),
            id,
            kind,
            done: false,
        };
        if rx.await.is_err() {
            // Senders are only dropped after a grant or by `Pending::drop`.
            tracing::error!(project_id = self.project_id, ?kind, "lock waiter dropped unexpectedly");
        }
        pending.done = true;
    }

    fn release(&self, kind: LockKind) {
        let mut state = self.state();
        match kind {
            LockKind::Worker => state.workers = state.workers.saturating_sub(1),
            LockKind::Sync => state.sync_held = false,
        }
        state.dispatch();
    }

    /// Undo a request whose acquiring future was dropped.
    fn abandon(&self, id: u64, kind: LockKind) {
        let mut state = self.state();
        if let Some(pos) = state.queue.iter().position(|w| w.id == id) {
            state.queue.remove(pos);
            // A removed sync head may have been blocking workers behind it.
            state.dispatch();
        } else {
            drop(state);
            self.release(kind);
        }
    }
}

struct Pending {
    lock: Arc<SyncLock>,
    id: u64,
    kind: LockKind,
    done: bool,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if !self.done {
            self.lock.abandon(self.id, self.kind);
        }
    }
}

/// Shared worker hold. Released on drop.
pub struct WorkerGuard {
    lock: Arc<SyncLock>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.lock.release(LockKind::Worker);
    }
}

/// Exclusive sync hold. Released on drop.
pub struct SyncGuard {
    lock: Arc<SyncLock>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.lock.release(LockKind::Sync);
    }
}

/// One `SyncLock` per project; no serialization across projects.
#[derive(Default)]
pub struct SyncLockRegistry {
    locks: Mutex<HashMap<i64, Arc<SyncLock>>>,
}

impl SyncLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, project_id: i64) -> Arc<SyncLock> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(project_id)
            .or_insert_with(|| SyncLock::new(project_id))
            .clone()
    }

    /// Forget a project's lock. Outstanding guards keep their instance alive.
    pub fn remove(&self, project_id: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn workers_share() {
        let lock = SyncLock::new(1);
        let a = lock.acquire_worker(0).await;
        let b = lock.acquire_worker(0).await;
        let c = lock.try_acquire_worker().unwrap();
        assert_eq!(lock.snapshot().workers, 3);
        assert!(lock.try_acquire_sync().is_none());
        drop((a, b, c));
        assert_eq!(lock.snapshot().workers, 0);
        assert!(lock.try_acquire_sync().is_some());
    }

    #[tokio::test]
    async fn sync_waits_for_workers_to_drain() {
        let lock = SyncLock::new(1);
        let w1 = lock.acquire_worker(0).await;
        let w2 = lock.acquire_worker(0).await;

        let l = lock.clone();
        let sync = tokio::spawn(async move {
            let _g = l.acquire_sync(0).await;
            l.snapshot()
        });
        settle().await;
        assert!(!sync.is_finished());
        assert_eq!(lock.snapshot().waiting_syncs, 1);

        drop(w1);
        settle().await;
        assert!(!sync.is_finished());

        drop(w2);
        let seen = tokio::time::timeout(Duration::from_secs(1), sync).await.unwrap().unwrap();
        assert!(seen.sync_held);
        assert_eq!(seen.workers, 0);
        assert!(!lock.snapshot().sync_held);
    }

    #[tokio::test]
    async fn no_worker_granted_while_sync_held() {
        let lock = SyncLock::new(1);
        let sync = lock.acquire_sync(0).await;
        assert!(lock.try_acquire_worker().is_none());

        let l = lock.clone();
        let worker = tokio::spawn(async move {
            let _g = l.acquire_worker(0).await;
        });
        settle().await;
        assert!(!worker.is_finished());
        assert_eq!(lock.snapshot().waiting_workers, 1);

        drop(sync);
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waiting_sync_blocks_later_workers() {
        let lock = SyncLock::new(1);
        let w = lock.acquire_worker(0).await;

        let l = lock.clone();
        let sync = tokio::spawn(async move {
            let _g = l.acquire_sync(0).await;
        });
        settle().await;

        // A worker arriving after the sync request queues behind it.
        assert!(lock.try_acquire_worker().is_none());
        let l = lock.clone();
        let late = tokio::spawn(async move {
            let _g = l.acquire_worker(0).await;
        });
        settle().await;
        assert!(!late.is_finished());

        drop(w);
        tokio::time::timeout(Duration::from_secs(1), sync).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), late).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn priority_then_fifo_order() {
        let lock = SyncLock::new(1);
        let hold = lock.acquire_sync(0).await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, priority) in [("low-1", 0), ("high", 5), ("low-2", 0)] {
            let l = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = l.acquire_sync(priority).await;
                order.lock().unwrap().push(name);
            }));
            settle().await;
        }
        drop(hold);
        for h in handles {
            tokio::time::timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_leak() {
        let lock = SyncLock::new(1);
        let w = lock.acquire_worker(0).await;
        // Polled once, left pending, then dropped.
        assert!(lock.acquire_sync(0).now_or_never().is_none());
        assert_eq!(lock.snapshot().waiting_syncs, 0);
        drop(w);
        assert!(lock.try_acquire_sync().is_some());

        let l = lock.clone();
        let task = tokio::spawn(async move {
            let _g = l.acquire_sync(0).await;
            futures::future::pending::<()>().await;
        });
        settle().await;
        assert!(lock.snapshot().sync_held);
        task.abort();
        let _ = task.await;
        assert!(!lock.snapshot().sync_held);
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let lock = SyncLock::new(1);
        let result: Result<(), &str> = lock
            .with_worker_lock(|| async {
                assert_eq!(lock.snapshot().workers, 1);
                Err("boom")
            })
            .await;
        assert!(result.is_err());
        assert_eq!(lock.snapshot().workers, 0);

        let value = lock.with_sync_lock(|| async { lock.snapshot().sync_held }).await;
        assert!(value);
        assert!(!lock.snapshot().sync_held);
    }

    #[test]
    fn registry_is_per_project() {
        let registry = SyncLockRegistry::new();
        let a = registry.get(1);
        let again = registry.get(1);
        let b = registry.get(2);
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));

        let _sync = a.try_acquire_sync().unwrap();
        assert!(b.try_acquire_worker().is_some());
        registry.remove(1);
        assert!(!Arc::ptr_eq(&a, &registry.get(1)));
    }
}
