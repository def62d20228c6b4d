//! Per-project worker pool.
//!
//! A pool keeps up to `workers.max_workers` slots busy. The poll loop never
//! overlaps itself: each iteration claims slots for eligible cards, starts a
//! pipeline per claim and then sleeps for an adaptive interval (or until
//! woken). A maintenance timer recovers orphaned slots, fails jobs whose
//! lease lapsed and removes worktrees whose cleanup delay has elapsed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FoundryToml;
use crate::errors::PoolError;
use crate::factory::agent::default_tools;
use crate::factory::db::DbHandle;
use crate::factory::events::{FactoryEvent, broadcast_message};
use crate::factory::models::{Card, JobState, JobType, Project, Slot, SlotClaim, SlotStatus, WorktreeStatus};
use crate::factory::pipeline::{PipelineEnv, PipelineLauncher, PipelineRequest, WorkerPipeline};
use crate::factory::sync_lock::{SyncLock, SyncLockRegistry};
use crate::factory::tracker::build_tracker;
use crate::factory::worktree::WorktreeManager;
use crate::util::retry_with_backoff;

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const SLOT_ACQUIRE_RETRIES: u32 = 3;
pub const SLOT_ACQUIRE_BACKOFF: Duration = Duration::from_millis(100);
pub const IN_FLIGHT_CAPACITY: usize = 100;
const BACKOFF_FACTOR: f64 = 1.5;

// ── Adaptive polling ─────────────────────────────────────────────────

/// Poll delay that grows by 1.5x per empty poll up to `max` and snaps
/// back to `min` once work is found.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    min: Duration,
    max: Duration,
    current: Duration,
    adaptive: bool,
}

impl AdaptiveInterval {
    pub fn new(min: Duration, max: Duration, adaptive: bool) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
            adaptive,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay before the next poll given whether this one found work.
    pub fn next_delay(&mut self, found_work: bool) -> Duration {
        if found_work || !self.adaptive {
            self.current = self.min;
        } else {
            self.current = self.current.mul_f64(BACKOFF_FACTOR).min(self.max);
        }
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

// ── In-flight runs ───────────────────────────────────────────────────

pub struct RunEntry {
    pub project_id: i64,
    pub slot_number: i64,
    pub card_id: i64,
    pub token: CancellationToken,
    /// Taken by `WorkerPool::stop`; the entry stays until the run ends.
    pub handle: Option<JoinHandle<()>>,
}

/// Handles of pipelines started by this process, shared by every pool.
/// Bounded: inserting past capacity evicts the oldest entry, detaching its
/// task without aborting it.
pub struct InFlightRuns {
    capacity: usize,
    runs: Mutex<VecDeque<(i64, RunEntry)>>,
}

impl Default for InFlightRuns {
    fn default() -> Self {
        Self::with_capacity(IN_FLIGHT_CAPACITY)
    }
}

impl InFlightRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(i64, RunEntry)>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track `job_id`. Returns the job id evicted to stay within capacity.
    pub fn insert(&self, job_id: i64, entry: RunEntry) -> Option<i64> {
        let mut runs = self.lock();
        runs.retain(|(id, _)| *id != job_id);
        runs.push_back((job_id, entry));
        if runs.len() <= self.capacity {
            return None;
        }
        let (evicted, entry) = runs.pop_front()?;
        tracing::warn!(
            job_id = evicted,
            project_id = entry.project_id,
            slot = entry.slot_number,
            capacity = self.capacity,
            "in-flight map full, detaching oldest run"
        );
        Some(evicted)
    }

    pub fn remove(&self, job_id: i64) -> Option<RunEntry> {
        let mut runs = self.lock();
        let index = runs.iter().position(|(id, _)| *id == job_id)?;
        runs.remove(index).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, job_id: i64) -> bool {
        self.lock().iter().any(|(id, _)| *id == job_id)
    }

    pub fn tracked_slots(&self, project_id: i64) -> Vec<i64> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.project_id == project_id)
            .map(|(_, e)| e.slot_number)
            .collect()
    }

    pub fn tracked_jobs(&self, project_id: i64) -> Vec<i64> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.project_id == project_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Cancel the in-process token of a tracked run.
    pub fn cancel(&self, job_id: i64) -> bool {
        match self.lock().iter().find(|(id, _)| *id == job_id) {
            Some((_, entry)) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_project(&self, project_id: i64) {
        for (_, entry) in self.lock().iter().filter(|(_, e)| e.project_id == project_id) {
            entry.token.cancel();
        }
    }

    /// Hand back the task handles of a project's runs. The entries stay
    /// tracked, so `cancel_project` still reaches them until each run
    /// removes itself.
    pub fn take_handles(&self, project_id: i64) -> Vec<(i64, JoinHandle<()>)> {
        self.lock()
            .iter_mut()
            .filter(|(_, e)| e.project_id == project_id)
            .filter_map(|(id, e)| e.handle.take().map(|h| (*id, h)))
            .collect()
    }
}

// ── Orphan detection ─────────────────────────────────────────────────

/// Running slots older than `threshold` with no tracked in-flight run.
pub fn select_orphans(slots: &[Slot], now: DateTime<Utc>, threshold: Duration, tracked_slots: &[i64]) -> Vec<Slot> {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    slots
        .iter()
        .filter(|s| s.status == SlotStatus::Running)
        .filter(|s| !tracked_slots.contains(&s.slot_number))
        .filter(|s| s.started_at.is_some_and(|t| now.signed_duration_since(t) > threshold))
        .cloned()
        .collect()
}

/// Remove worktrees whose delayed cleanup is due. Returns how many were removed.
pub async fn cleanup_due_worktrees(db: &DbHandle, manager: &WorktreeManager, project_id: i64) -> Result<usize> {
    let due = db
        .call(move |db| db.list_cleanup_due(project_id, Utc::now()))
        .await?;
    let mut removed = 0;
    for record in due {
        let path = std::path::PathBuf::from(&record.path);
        match manager.remove_worktree(&path, true).await {
            Ok(()) => {
                let id = record.id;
                db.call(move |db| db.update_worktree_status(id, WorktreeStatus::Cleaned))
                    .await?;
                tracing::info!(project_id, path = %record.path, "removed expired worktree");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(project_id, path = %record.path, error = %e, "failed to remove expired worktree");
            }
        }
    }
    Ok(removed)
}

// ── Worker pool ──────────────────────────────────────────────────────

pub struct WorkerPool {
    project: Project,
    db: DbHandle,
    config: Arc<FoundryToml>,
    launcher: Arc<dyn PipelineLauncher>,
    in_flight: Arc<InFlightRuns>,
    worktrees: WorktreeManager,
    events: broadcast::Sender<String>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        project: Project,
        db: DbHandle,
        config: Arc<FoundryToml>,
        launcher: Arc<dyn PipelineLauncher>,
        in_flight: Arc<InFlightRuns>,
        events: broadcast::Sender<String>,
    ) -> Arc<Self> {
        let worktrees = WorktreeManager::new(
            &project.path,
            config.worktree_root(std::path::Path::new(&project.path)),
            config.git.remote.clone(),
            config.git_timeout(),
        );
        Arc::new(Self {
            project,
            db,
            config,
            launcher,
            in_flight,
            worktrees,
            events,
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn project_id(&self) -> i64 {
        self.project.id
    }

    /// Create the slots and start the poll and maintenance loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let project_id = self.project.id;
        let max_workers = self.config.max_workers();
        self.db
            .call(move |db| db.init_slots(project_id, max_workers))
            .await?;

        let poller = tokio::spawn(self.clone().poll_loop());
        let maintenance = tokio::spawn(self.clone().maintenance_loop());
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([poller, maintenance]);

        tracing::info!(project_id, max_workers, "worker pool started");
        broadcast_message(&self.events, &FactoryEvent::PoolStarted { project_id, max_workers });
        Ok(())
    }

    /// Force an immediate poll with the interval reset.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop the loops, then wait for every run this pool started.
    pub async fn stop(&self) {
        let project_id = self.project.id;
        self.shutdown.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(project_id, error = %e, "pool task ended abnormally");
            }
        }
        let runs = self.in_flight.take_handles(project_id);
        if !runs.is_empty() {
            tracing::info!(project_id, count = runs.len(), "waiting for in-flight runs");
        }
        for (job_id, handle) in runs {
            if let Err(e) = handle.await {
                tracing::warn!(project_id, job_id, error = %e, "run task ended abnormally");
            }
        }
        tracing::info!(project_id, "worker pool stopped");
        broadcast_message(&self.events, &FactoryEvent::PoolStopped { project_id });
    }

    /// Cancel the in-process tokens of this pool's runs.
    pub fn cancel_runs(&self) {
        self.in_flight.cancel_project(self.project.id);
    }

    async fn poll_loop(self: Arc<Self>) {
        let (min, max) = self.config.poll_bounds();
        let mut interval = AdaptiveInterval::new(min, max, self.config.workers.adaptive_polling);
        loop {
            let found = match self.poll_once().await {
                Ok(started) => started > 0,
                Err(e) => {
                    tracing::warn!(project_id = self.project.id, error = %e, "poll failed");
                    false
                }
            };
            let delay = interval.next_delay(found);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => interval.reset(),
            }
        }
    }

    /// One poll: claim a slot per eligible card and start its pipeline.
    /// Returns how many runs were started.
    pub async fn poll_once(&self) -> Result<usize> {
        let project_id = self.project.id;
        let idle = self.db.call(move |db| db.count_idle_slots(project_id)).await?;
        if idle == 0 {
            return Ok(0);
        }
        let cooldown = self.config.failure_cooldown();
        let cards = self
            .db
            .call(move |db| db.list_eligible_cards(project_id, idle, cooldown, Utc::now()))
            .await?;

        let mut started = 0;
        for card in cards {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.claim_slot(card.id).await {
                Ok(Some(slot)) => {
                    self.launch(card, slot).await?;
                    started += 1;
                }
                Ok(None) => break,
                Err(e) => tracing::warn!(project_id, card_id = card.id, error = %e, "slot acquisition failed"),
            }
        }
        if started > 0 {
            self.emit_snapshot().await;
        }
        Ok(started)
    }

    /// `Ok(None)` once no idle slot is left.
    async fn claim_slot(&self, card_id: i64) -> Result<Option<Slot>, PoolError> {
        let project_id = self.project.id;
        let db = self.db.clone();
        retry_with_backoff(SLOT_ACQUIRE_RETRIES, SLOT_ACQUIRE_BACKOFF, move |_| {
            let db = db.clone();
            async move {
                match db
                    .call(move |db| db.acquire_idle_slot(project_id, card_id, Utc::now()))
                    .await?
                {
                    SlotClaim::Acquired(slot) => Ok(Some(slot)),
                    SlotClaim::Exhausted => Ok(None),
                    SlotClaim::Contended => bail!("slot claim lost a race"),
                }
            }
        })
        .await
        .map_err(|e| match e {
            PoolError::RetryExhausted { attempts, .. } => PoolError::SlotAcquisition {
                project_id,
                card_id,
                attempts,
            },
            other => other,
        })
    }

    async fn launch(&self, card: Card, slot: Slot) -> Result<()> {
        let project_id = self.project.id;
        let (card_id, slot_number) = (card.id, slot.slot_number);
        let job = self
            .db
            .call(move |db| {
                let job = db.create_job(project_id, Some(card_id), JobType::AgentRun);
                match job {
                    Ok(job) => {
                        db.assign_slot_job(project_id, slot_number, job.id)?;
                        Ok(job)
                    }
                    Err(e) => {
                        db.release_slot(project_id, slot_number)?;
                        Err(e)
                    }
                }
            })
            .await?;
        let job_id = job.id;
        tracing::info!(project_id, card_id, job_id, slot = slot_number, "starting pipeline");

        let token = CancellationToken::new();
        let request = PipelineRequest {
            project: self.project.clone(),
            card,
            job_id,
            slot_number,
        };
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let launcher = self.launcher.clone();
        let in_flight = self.in_flight.clone();
        let db = self.db.clone();
        let events = self.events.clone();
        let wake = self.wake.clone();
        let run_token = token.clone();
        let lease_ttl = Duration::from_secs(self.config.workers.lease_ttl_secs);

        let handle = tokio::spawn(async move {
            // Wait until the handle is tracked so removal cannot race insertion.
            let _ = go_rx.await;
            let run = tokio::spawn(async move { launcher.launch(request, run_token).await });
            match run.await {
                Ok(result) => tracing::info!(
                    job_id,
                    success = result.success,
                    canceled = result.canceled,
                    phase = %result.phase,
                    "pipeline finished"
                ),
                Err(e) => {
                    tracing::error!(job_id, error = %e, "pipeline task panicked");
                    let message = format!("pipeline task panicked: {}", e);
                    let recovered = db
                        .call(move |db| {
                            if let Err(e) = db.transition_job(job_id, JobState::Failed, Some(&message), None, lease_ttl) {
                                tracing::debug!(job_id, error = %e, "job already terminal");
                            }
                            db.release_slot(project_id, slot_number)
                        })
                        .await;
                    if let Err(e) = recovered {
                        tracing::error!(job_id, error = %e, "failed to recover after panic");
                    }
                }
            }
            in_flight.remove(job_id);
            if let Ok(snapshot) = db.call(move |db| db.pool_snapshot(project_id)).await {
                broadcast_message(&events, &FactoryEvent::PoolStatusChanged { snapshot });
            }
            wake.notify_one();
        });

        self.in_flight.insert(
            job_id,
            RunEntry {
                project_id,
                slot_number,
                card_id,
                token,
                handle: Some(handle),
            },
        );
        let _ = go_tx.send(());
        Ok(())
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.maintain().await {
                tracing::warn!(project_id = self.project.id, error = %e, "maintenance pass failed");
            }
        }
    }

    /// Orphan sweep, lease expiry and delayed worktree cleanup.
    pub async fn maintain(&self) -> Result<()> {
        let project_id = self.project.id;
        if self.config.workers.orphan_cleanup {
            let released = self.sweep_orphans().await?;
            if released > 0 {
                self.wake();
            }
        }

        let tracked = self.in_flight.tracked_jobs(project_id);
        let expired = self
            .db
            .call(move |db| db.fail_expired_leases(project_id, Utc::now(), &tracked))
            .await?;
        for job_id in expired {
            tracing::warn!(project_id, job_id, "job lease expired, marked failed");
            broadcast_message(
                &self.events,
                &FactoryEvent::JobStateChanged {
                    job_id,
                    card_id: None,
                    state: JobState::Failed,
                },
            );
        }

        cleanup_due_worktrees(&self.db, &self.worktrees, project_id).await?;
        Ok(())
    }

    /// Force-release orphaned slots. Returns how many were released.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let project_id = self.project.id;
        let slots = self.db.call(move |db| db.list_slots(project_id)).await?;
        let tracked = self.in_flight.tracked_slots(project_id);
        let orphans = select_orphans(&slots, Utc::now(), self.config.orphan_threshold(), &tracked);
        let lease_ttl = Duration::from_secs(self.config.workers.lease_ttl_secs);

        for slot in &orphans {
            let (slot_number, job_id) = (slot.slot_number, slot.job_id);
            tracing::warn!(project_id, slot = slot_number, job_id, "releasing orphaned slot");
            self.db
                .call(move |db| {
                    if let Some(job_id) = job_id
                        && let Err(e) = db.transition_job(
                            job_id,
                            JobState::Failed,
                            Some("worker slot orphaned"),
                            None,
                            lease_ttl,
                        )
                    {
                        tracing::debug!(job_id, error = %e, "orphaned job already terminal");
                    }
                    db.release_slot(project_id, slot_number)
                })
                .await?;
            broadcast_message(
                &self.events,
                &FactoryEvent::SlotReleased {
                    project_id,
                    slot_number,
                    orphaned: true,
                },
            );
        }
        Ok(orphans.len())
    }

    async fn emit_snapshot(&self) {
        let project_id = self.project.id;
        match self.db.call(move |db| db.pool_snapshot(project_id)).await {
            Ok(snapshot) => broadcast_message(&self.events, &FactoryEvent::PoolStatusChanged { snapshot }),
            Err(e) => tracing::debug!(project_id, error = %e, "failed to read pool snapshot"),
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Owns the pools of one process.
///
/// Lifecycle: create once at startup, `start_pool` per project, and
/// `stop_all` before exit. The in-flight map and the per-project sync locks
/// are shared by every pool the registry starts.
pub struct PoolRegistry {
    db: DbHandle,
    events: broadcast::Sender<String>,
    in_flight: Arc<InFlightRuns>,
    sync_locks: SyncLockRegistry,
    pools: tokio::sync::Mutex<HashMap<i64, Arc<WorkerPool>>>,
}

impl PoolRegistry {
    pub fn new(db: DbHandle, events: broadcast::Sender<String>) -> Self {
        Self {
            db,
            events,
            in_flight: Arc::new(InFlightRuns::new()),
            sync_locks: SyncLockRegistry::new(),
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn events(&self) -> &broadcast::Sender<String> {
        &self.events
    }

    pub fn in_flight(&self) -> &Arc<InFlightRuns> {
        &self.in_flight
    }

    pub fn sync_lock(&self, project_id: i64) -> Arc<SyncLock> {
        self.sync_locks.get(project_id)
    }

    /// Start a pool that runs the real pipeline with the configured agents
    /// and tracker.
    pub async fn start_pool(&self, project: Project, config: Arc<FoundryToml>) -> Result<Arc<WorkerPool>> {
        let tools = default_tools(&config);
        let tracker = build_tracker(&config, std::path::Path::new(&project.path));
        let env = PipelineEnv::new(
            self.db.clone(),
            config.clone(),
            &project.path,
            tools,
            tracker,
            self.sync_lock(project.id),
            self.events.clone(),
        );
        let launcher: Arc<dyn PipelineLauncher> = Arc::new(WorkerPipeline::new(Arc::new(env)));
        self.start_pool_with(project, config, launcher).await
    }

    pub async fn start_pool_with(
        &self,
        project: Project,
        config: Arc<FoundryToml>,
        launcher: Arc<dyn PipelineLauncher>,
    ) -> Result<Arc<WorkerPool>> {
        let mut pools = self.pools.lock().await;
        if pools.contains_key(&project.id) {
            return Err(PoolError::AlreadyRunning { project_id: project.id }.into());
        }
        let project_id = project.id;
        let pool = WorkerPool::new(
            project,
            self.db.clone(),
            config,
            launcher,
            self.in_flight.clone(),
            self.events.clone(),
        );
        pool.start().await?;
        pools.insert(project_id, pool.clone());
        Ok(pool)
    }

    pub async fn pool(&self, project_id: i64) -> Option<Arc<WorkerPool>> {
        self.pools.lock().await.get(&project_id).cloned()
    }

    pub async fn stop_pool(&self, project_id: i64) -> Result<()> {
        let pool = self
            .pools
            .lock()
            .await
            .remove(&project_id)
            .ok_or(PoolError::NotRunning { project_id })?;
        pool.stop().await;
        self.sync_locks.remove(project_id);
        Ok(())
    }

    pub async fn stop_all(&self) {
        let pools: Vec<_> = self.pools.lock().await.drain().collect();
        for (project_id, pool) in pools {
            pool.stop().await;
            self.sync_locks.remove(project_id);
        }
    }

    /// Cancel every in-process run without waiting.
    pub async fn cancel_all_runs(&self) {
        for pool in self.pools.lock().await.values() {
            pool.cancel_runs();
        }
    }

    pub async fn wake(&self, project_id: i64) -> bool {
        match self.pool(project_id).await {
            Some(pool) => {
                pool.wake();
                true
            }
            None => false,
        }
    }

    /// Mark the job canceled and signal its in-process run, if any.
    pub async fn cancel_job(&self, job_id: i64, reason: &str) -> Result<bool> {
        let reason = reason.to_string();
        let canceled = self
            .db
            .call(move |db| db.cancel_job(job_id, &reason))
            .await?;
        let signaled = self.in_flight.cancel(job_id);
        if canceled || signaled {
            tracing::info!(job_id, signaled, "job cancel requested");
        }
        Ok(canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::db::FactoryDb;
    use crate::factory::models::CardStatus;
    use crate::factory::pipeline::PipelineResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    fn slot(number: i64, status: SlotStatus, age_minutes: Option<i64>, now: DateTime<Utc>) -> Slot {
        Slot {
            project_id: 1,
            slot_number: number,
            status,
            card_id: Some(number),
            job_id: Some(number),
            worktree_id: None,
            started_at: age_minutes.map(|m| now - chrono::Duration::minutes(m)),
        }
    }

    #[test]
    fn interval_grows_and_resets() {
        let mut interval = AdaptiveInterval::new(Duration::from_secs(1), Duration::from_secs(60), true);
        let mut previous = interval.current();
        for _ in 0..20 {
            let next = interval.next_delay(false);
            assert!(next >= previous);
            assert!(next <= Duration::from_secs(60));
            previous = next;
        }
        assert_eq!(previous, Duration::from_secs(60));
        assert_eq!(interval.next_delay(true), Duration::from_secs(1));
        assert_eq!(interval.next_delay(false), Duration::from_millis(1500));
    }

    #[test]
    fn fixed_interval_when_not_adaptive() {
        let mut interval = AdaptiveInterval::new(Duration::from_secs(2), Duration::from_secs(60), false);
        assert_eq!(interval.next_delay(false), Duration::from_secs(2));
        assert_eq!(interval.next_delay(false), Duration::from_secs(2));
    }

    #[test]
    fn orphans_require_age_and_no_tracked_run() {
        let now = Utc::now();
        let threshold = Duration::from_secs(30 * 60);
        let slots = vec![
            slot(1, SlotStatus::Running, Some(45), now),
            slot(2, SlotStatus::Running, Some(10), now),
            slot(3, SlotStatus::Running, Some(45), now),
            slot(4, SlotStatus::Idle, None, now),
        ];
        let orphans = select_orphans(&slots, now, threshold, &[3]);
        let numbers: Vec<_> = orphans.iter().map(|s| s.slot_number).collect();
        assert_eq!(numbers, vec![1]);
    }

    #[tokio::test]
    async fn in_flight_evicts_oldest_without_aborting() {
        let runs = InFlightRuns::with_capacity(2);
        let (done_tx, done_rx) = oneshot::channel();
        let first = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = done_tx.send(());
        });
        let entry = |handle| RunEntry {
            project_id: 1,
            slot_number: 1,
            card_id: 1,
            token: CancellationToken::new(),
            handle: Some(handle),
        };
        assert_eq!(runs.insert(10, entry(first)), None);
        assert_eq!(runs.insert(11, entry(tokio::spawn(async {}))), None);
        assert_eq!(runs.insert(12, entry(tokio::spawn(async {}))), Some(10));
        assert_eq!(runs.len(), 2);
        assert!(!runs.contains(10));
        assert!(runs.contains(12));
        // The evicted run keeps going.
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn in_flight_cancel_and_take() {
        let runs = InFlightRuns::new();
        let token = CancellationToken::new();
        runs.insert(
            5,
            RunEntry {
                project_id: 2,
                slot_number: 1,
                card_id: 9,
                token: token.clone(),
                handle: Some(tokio::spawn(async {})),
            },
        );
        assert_eq!(runs.tracked_slots(2), vec![1]);
        assert!(runs.tracked_slots(1).is_empty());
        assert!(runs.cancel(5));
        assert!(token.is_cancelled());
        assert!(!runs.cancel(6));
        assert_eq!(runs.take_handles(2).len(), 1);
        assert!(runs.take_handles(2).is_empty());
        // Still tracked, so a late cancel reaches it.
        assert!(runs.contains(5));
        assert!(runs.remove(5).is_some());
        assert!(runs.is_empty());
    }

    /// Holds every run until the test hands out a permit, then finishes it
    /// the way the real pipeline does.
    struct GatedLauncher {
        db: DbHandle,
        gate: Arc<Semaphore>,
        active: AtomicUsize,
        peak: AtomicUsize,
        launched: AtomicUsize,
    }

    #[async_trait]
    impl PipelineLauncher for GatedLauncher {
        async fn launch(&self, request: PipelineRequest, _token: CancellationToken) -> PipelineResult {
            self.launched.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.active.fetch_sub(1, Ordering::SeqCst);

            let (job_id, card_id) = (request.job_id, request.card.id);
            let (project_id, slot) = (request.project.id, request.slot_number);
            self.db
                .call(move |db| {
                    let ttl = Duration::from_secs(60);
                    db.transition_job(job_id, JobState::Running, None, None, ttl)?;
                    db.transition_job(job_id, JobState::Succeeded, None, None, ttl)?;
                    db.update_card_status(card_id, CardStatus::InReview)?;
                    db.release_slot(project_id, slot)
                })
                .await
                .unwrap();
            PipelineResult {
                success: true,
                phase: "done".into(),
                error: None,
                pr_url: None,
                logs: vec![],
                visited: vec![],
                canceled: false,
                fallback_used: false,
            }
        }
    }

    async fn wait_for_idle(db: &DbHandle, project_id: i64, want: usize) {
        for _ in 0..200 {
            let idle = db.call(move |db| db.count_idle_slots(project_id)).await.unwrap();
            if idle == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slots never reached {} idle", want);
    }

    #[tokio::test]
    async fn two_workers_three_cards() {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let project = db.call(|db| db.create_project("demo", "/tmp/demo")).await.unwrap();
        let pid = project.id;
        db.call(move |db| {
            for title in ["a", "b", "c"] {
                db.create_card(pid, title, "", CardStatus::Ready)?;
            }
            Ok(())
        })
        .await
        .unwrap();

        let mut toml = FoundryToml::default();
        toml.workers.max_workers = 2;
        let launcher = Arc::new(GatedLauncher {
            db: db.clone(),
            gate: Arc::new(Semaphore::new(0)),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            launched: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new(
            project,
            db.clone(),
            Arc::new(toml),
            launcher.clone(),
            Arc::new(InFlightRuns::new()),
            crate::factory::events::channel(),
        );
        db.call(move |db| db.init_slots(pid, 2)).await.unwrap();

        assert_eq!(pool.poll_once().await.unwrap(), 2);
        assert_eq!(pool.poll_once().await.unwrap(), 0);

        launcher.gate.add_permits(1);
        wait_for_idle(&db, pid, 1).await;
        assert_eq!(pool.poll_once().await.unwrap(), 1);

        launcher.gate.add_permits(2);
        wait_for_idle(&db, pid, 2).await;
        pool.stop().await;
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);
        assert_eq!(launcher.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sweep_releases_only_untracked_orphans() {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let project = db.call(|db| db.create_project("demo", "/tmp/demo")).await.unwrap();
        let pid = project.id;
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        db.call(move |db| {
            db.init_slots(pid, 2)?;
            let card = db.create_card(pid, "stale", "", CardStatus::InProgress)?;
            let job = db.create_job(pid, Some(card.id), JobType::AgentRun)?;
            match db.acquire_idle_slot(pid, card.id, long_ago)? {
                SlotClaim::Acquired(slot) => db.assign_slot_job(pid, slot.slot_number, job.id),
                other => anyhow::bail!("unexpected claim {:?}", other),
            }
        })
        .await
        .unwrap();

        let pool = WorkerPool::new(
            project,
            db.clone(),
            Arc::new(FoundryToml::default()),
            Arc::new(GatedLauncher {
                db: db.clone(),
                gate: Arc::new(Semaphore::new(0)),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                launched: AtomicUsize::new(0),
            }),
            Arc::new(InFlightRuns::new()),
            crate::factory::events::channel(),
        );
        assert_eq!(pool.sweep_orphans().await.unwrap(), 1);
        assert_eq!(db.call(move |db| db.count_idle_slots(pid)).await.unwrap(), 2);
        assert_eq!(pool.sweep_orphans().await.unwrap(), 0);
    }

    /// Waits on its token for up to three seconds and records whether the
    /// cancel arrived.
    struct CancelAwareLauncher {
        db: DbHandle,
        observed_cancel: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl PipelineLauncher for CancelAwareLauncher {
        async fn launch(&self, request: PipelineRequest, token: CancellationToken) -> PipelineResult {
            let canceled = tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(Duration::from_secs(3)) => false,
            };
            self.observed_cancel.store(canceled, Ordering::SeqCst);
            let (project_id, slot) = (request.project.id, request.slot_number);
            self.db
                .call(move |db| db.release_slot(project_id, slot))
                .await
                .unwrap();
            PipelineResult {
                success: !canceled,
                phase: "ai".into(),
                error: None,
                pr_url: None,
                logs: vec![],
                visited: vec![],
                canceled,
                fallback_used: false,
            }
        }
    }

    #[tokio::test]
    async fn cancel_reaches_runs_while_stopping() {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let project = db.call(|db| db.create_project("demo", "/tmp/demo")).await.unwrap();
        let pid = project.id;
        db.call(move |db| {
            db.create_card(pid, "long", "", CardStatus::Ready)?;
            db.init_slots(pid, 1)
        })
        .await
        .unwrap();

        let launcher = Arc::new(CancelAwareLauncher {
            db: db.clone(),
            observed_cancel: std::sync::atomic::AtomicBool::new(false),
        });
        let in_flight = Arc::new(InFlightRuns::new());
        let pool = WorkerPool::new(
            project,
            db.clone(),
            Arc::new(FoundryToml::default()),
            launcher.clone(),
            in_flight.clone(),
            crate::factory::events::channel(),
        );
        assert_eq!(pool.poll_once().await.unwrap(), 1);
        assert_eq!(in_flight.tracked_jobs(pid).len(), 1);

        let started = std::time::Instant::now();
        let stopping = tokio::spawn({
            let pool = pool.clone();
            async move { pool.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(in_flight.tracked_jobs(pid).len(), 1);
        in_flight.cancel_project(pid);

        stopping.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(launcher.observed_cancel.load(Ordering::SeqCst));
        assert!(in_flight.is_empty());
    }
}
