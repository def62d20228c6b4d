use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use super::models::*;

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FactoryDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Fixed-width RFC 3339 timestamps so string comparison in SQL orders correctly.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Invalid timestamp '{}'", s))
        })
        .transpose()
}

fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct FactoryDb {
    conn: Connection,
}

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL UNIQUE,
                    remote_repo TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS cards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'draft',
                    labels TEXT NOT NULL DEFAULT '[]',
                    remote_issue_number INTEGER,
                    last_failed_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    card_id INTEGER REFERENCES cards(id) ON DELETE CASCADE,
                    job_type TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'queued',
                    lease_expires_at TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    result TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS worktrees (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    card_id INTEGER NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
                    path TEXT NOT NULL UNIQUE,
                    branch TEXT NOT NULL,
                    base_ref TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'creating',
                    lock_holder TEXT,
                    lock_expires_at TEXT,
                    cleanup_after TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS worker_slots (
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    slot_number INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'idle',
                    card_id INTEGER,
                    job_id INTEGER,
                    worktree_id INTEGER,
                    started_at TEXT,
                    PRIMARY KEY (project_id, slot_number)
                );

                CREATE TABLE IF NOT EXISTS progress_checkpoints (
                    job_id INTEGER PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
                    card_id INTEGER NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    iteration INTEGER NOT NULL DEFAULT 0,
                    completed_subtasks INTEGER NOT NULL DEFAULT 0,
                    context_summary TEXT NOT NULL DEFAULT '',
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS subtasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    card_id INTEGER NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    remote_issue_number INTEGER,
                    UNIQUE (card_id, position)
                );

                CREATE INDEX IF NOT EXISTS idx_cards_project_status ON cards(project_id, status);
                CREATE INDEX IF NOT EXISTS idx_jobs_card_state ON jobs(card_id, state);
                CREATE INDEX IF NOT EXISTS idx_worktrees_card ON worktrees(card_id);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_card ON progress_checkpoints(card_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, path: &str) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, path) VALUES (?1, ?2)",
                params![name, path],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, path, remote_repo, created_at FROM projects WHERE id = ?1",
                params![id],
                project_row,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn find_project_by_path(&self, path: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, path, remote_repo, created_at FROM projects WHERE path = ?1",
                params![path],
                project_row,
            )
            .optional()
            .context("Failed to query project by path")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, remote_repo, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], project_row)
            .context("Failed to query projects")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read project row")
    }

    pub fn update_project_remote(&self, id: i64, remote_repo: Option<&str>) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET remote_repo = ?1 WHERE id = ?2",
                params![remote_repo, id],
            )
            .context("Failed to update project remote_repo")?;
        self.get_project(id)?
            .context("Project not found after remote_repo update")
    }

    // ── Cards ─────────────────────────────────────────────────────────

    pub fn create_card(
        &self,
        project_id: i64,
        title: &str,
        description: &str,
        status: CardStatus,
    ) -> Result<Card> {
        self.conn
            .execute(
                "INSERT INTO cards (project_id, title, description, status) VALUES (?1, ?2, ?3, ?4)",
                params![project_id, title, description, status.as_str()],
            )
            .context("Failed to insert card")?;
        let id = self.conn.last_insert_rowid();
        self.get_card(id)?.context("Card not found after insert")
    }

    pub fn get_card(&self, id: i64) -> Result<Option<Card>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1"),
                params![id],
                card_row,
            )
            .optional()
            .context("Failed to query card")?;
        row.map(CardRow::into_card).transpose()
    }

    pub fn list_cards(&self, project_id: i64) -> Result<Vec<Card>> {
        self.query_cards(
            &format!("SELECT {CARD_COLUMNS} FROM cards WHERE project_id = ?1 ORDER BY id"),
            params![project_id],
        )
    }

    pub fn get_card_status(&self, id: i64) -> Result<Option<CardStatus>> {
        let status: Option<String> = self
            .conn
            .query_row("SELECT status FROM cards WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to query card status")?;
        status
            .map(|s| CardStatus::from_str(&s).map_err(|e| anyhow::anyhow!(e)))
            .transpose()
    }

    pub fn update_card_status(&self, id: i64, status: CardStatus) -> Result<Card> {
        let changed = self
            .conn
            .execute(
                "UPDATE cards SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update card status")?;
        if changed == 0 {
            bail!("Card {} not found", id);
        }
        self.get_card(id)?.context("Card not found after status update")
    }

    /// Compare-and-swap on card status. Returns false when the card was not
    /// in `expected`.
    pub fn transition_card_status(
        &self,
        id: i64,
        expected: CardStatus,
        status: CardStatus,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE cards SET status = ?1, updated_at = datetime('now') WHERE id = ?2 AND status = ?3",
                params![status.as_str(), id, expected.as_str()],
            )
            .context("Failed to transition card status")?;
        Ok(changed == 1)
    }

    /// Return a card to `ready` after a failed run and start its cooldown.
    /// Only applies while the card is still `in_progress`.
    pub fn mark_card_failed(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE cards SET status = 'ready', last_failed_at = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = 'in_progress'",
                params![ts(now), id],
            )
            .context("Failed to mark card failed")?;
        Ok(changed == 1)
    }

    pub fn set_card_remote_issue(&self, id: i64, number: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cards SET remote_issue_number = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![number, id],
            )
            .context("Failed to set card remote issue")?;
        Ok(())
    }

    pub fn set_card_labels(&self, id: i64, labels: &[String]) -> Result<()> {
        let json = serde_json::to_string(labels).context("Failed to serialize labels")?;
        self.conn
            .execute(
                "UPDATE cards SET labels = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to set card labels")?;
        Ok(())
    }

    pub fn find_card_by_remote_issue(&self, project_id: i64, number: i64) -> Result<Option<Card>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CARD_COLUMNS} FROM cards WHERE project_id = ?1 AND remote_issue_number = ?2"
                ),
                params![project_id, number],
                card_row,
            )
            .optional()
            .context("Failed to query card by remote issue")?;
        row.map(CardRow::into_card).transpose()
    }

    /// Cards a pool may pick up: `ready`, no queued/running job, and outside
    /// the failure cooldown window.
    pub fn list_eligible_cards(
        &self,
        project_id: i64,
        limit: usize,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Card>> {
        let cutoff = ts(before(now, cooldown));
        self.query_cards(
            &format!(
                "SELECT {CARD_COLUMNS} FROM cards c
                 WHERE c.project_id = ?1
                   AND c.status = 'ready'
                   AND (c.last_failed_at IS NULL OR c.last_failed_at <= ?2)
                   AND NOT EXISTS (
                       SELECT 1 FROM jobs j
                       WHERE j.card_id = c.id AND j.state IN ('queued', 'running')
                   )
                 ORDER BY c.id
                 LIMIT ?3"
            ),
            params![project_id, cutoff, limit as i64],
        )
    }

    pub fn count_cards_with_status(&self, project_id: i64, status: CardStatus) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM cards WHERE project_id = ?1 AND status = ?2",
                params![project_id, status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count cards")?;
        Ok(n as usize)
    }

    fn query_cards(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Card>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare card query")?;
        let rows = stmt
            .query_map(params, card_row)
            .context("Failed to query cards")?;
        let mut cards = Vec::new();
        for row in rows {
            let r = row.context("Failed to read card row")?;
            cards.push(r.into_card()?);
        }
        Ok(cards)
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        project_id: i64,
        card_id: Option<i64>,
        job_type: JobType,
    ) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (project_id, card_id, job_type) VALUES (?1, ?2, ?3)",
                params![project_id, card_id, job_type.as_str()],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                job_row,
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn get_job_state(&self, id: i64) -> Result<Option<JobState>> {
        let state: Option<String> = self
            .conn
            .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to query job state")?;
        state
            .map(|s| JobState::from_str(&s).map_err(|e| anyhow::anyhow!(e)))
            .transpose()
    }

    pub fn list_jobs(&self, project_id: i64, limit: usize) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2"
            ))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![project_id, limit as i64], job_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Move a job to `to`, rejecting transitions out of terminal states.
    /// Entering `running` bumps the attempt count and grants a lease of
    /// `lease_ttl`.
    pub fn transition_job(
        &self,
        id: i64,
        to: JobState,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
        lease_ttl: Duration,
    ) -> Result<Job> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin job transition")?;
        let current: String = tx
            .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to read job state")?
            .with_context(|| format!("Job {} not found", id))?;
        let from = JobState::from_str(&current).map_err(|e| anyhow::anyhow!(e))?;
        if !is_valid_transition(&from, &to) {
            bail!("Invalid job transition {} -> {} for job {}", from, to, id);
        }

        let now = Utc::now();
        let result_json = result
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize job result")?;
        if to == JobState::Running {
            tx.execute(
                "UPDATE jobs SET state = ?1, attempts = attempts + 1, started_at = ?2, lease_expires_at = ?3
                 WHERE id = ?4",
                params![to.as_str(), ts(now), ts(after(now, lease_ttl)), id],
            )
            .context("Failed to start job")?;
        } else {
            tx.execute(
                "UPDATE jobs SET state = ?1, error = COALESCE(?2, error), result = COALESCE(?3, result),
                        finished_at = ?4, lease_expires_at = NULL
                 WHERE id = ?5",
                params![to.as_str(), error, result_json, ts(now), id],
            )
            .context("Failed to finish job")?;
        }
        tx.commit().context("Failed to commit job transition")?;
        self.get_job(id)?.context("Job not found after transition")
    }

    /// Mark a job canceled. Returns false when it already reached a
    /// terminal state.
    pub fn cancel_job(&self, id: i64, reason: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'canceled', error = ?1, finished_at = ?2, lease_expires_at = NULL
                 WHERE id = ?3 AND state IN ('queued', 'running')",
                params![reason, ts(Utc::now()), id],
            )
            .context("Failed to cancel job")?;
        Ok(changed == 1)
    }

    /// Extend a running job's lease. Returns false if the job is no longer
    /// running.
    pub fn renew_lease(&self, id: i64, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2 AND state = 'running'",
                params![ts(after(now, ttl)), id],
            )
            .context("Failed to renew job lease")?;
        Ok(changed == 1)
    }

    /// Fail running jobs of `project_id` whose lease lapsed, skipping the
    /// ids still tracked in-process. Returns the failed job ids.
    pub fn fail_expired_leases(
        &self,
        project_id: i64,
        now: DateTime<Utc>,
        tracked: &[i64],
    ) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM jobs
                 WHERE project_id = ?1 AND state = 'running'
                   AND lease_expires_at IS NOT NULL AND lease_expires_at < ?2",
            )
            .context("Failed to prepare expired lease query")?;
        let ids = stmt
            .query_map(params![project_id, ts(now)], |row| row.get::<_, i64>(0))
            .context("Failed to query expired leases")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read expired lease row")?;
        let mut failed = Vec::new();
        for id in ids.into_iter().filter(|id| !tracked.contains(id)) {
            let changed = self
                .conn
                .execute(
                    "UPDATE jobs SET state = 'failed', error = 'lease expired', finished_at = ?1,
                            lease_expires_at = NULL
                     WHERE id = ?2 AND state = 'running'",
                    params![ts(now), id],
                )
                .context("Failed to fail expired job")?;
            if changed == 1 {
                failed.push(id);
            }
        }
        Ok(failed)
    }

    // ── Worker slots ──────────────────────────────────────────────────

    /// Ensure slots `1..=count` exist for the project and drop idle slots
    /// above `count`. Running slots above the limit drain naturally.
    pub fn init_slots(&self, project_id: i64, count: usize) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin slot init")?;
        for n in 1..=count as i64 {
            tx.execute(
                "INSERT OR IGNORE INTO worker_slots (project_id, slot_number) VALUES (?1, ?2)",
                params![project_id, n],
            )
            .context("Failed to insert slot")?;
        }
        tx.execute(
            "DELETE FROM worker_slots WHERE project_id = ?1 AND slot_number > ?2 AND status = 'idle'",
            params![project_id, count as i64],
        )
        .context("Failed to trim slots")?;
        tx.commit().context("Failed to commit slot init")?;
        Ok(())
    }

    pub fn list_slots(&self, project_id: i64) -> Result<Vec<Slot>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SLOT_COLUMNS} FROM worker_slots WHERE project_id = ?1 ORDER BY slot_number"
            ))
            .context("Failed to prepare list_slots")?;
        let rows = stmt
            .query_map(params![project_id], slot_row)
            .context("Failed to query slots")?;
        let mut slots = Vec::new();
        for row in rows {
            slots.push(row.context("Failed to read slot row")?.into_slot()?);
        }
        Ok(slots)
    }

    pub fn count_idle_slots(&self, project_id: i64) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM worker_slots WHERE project_id = ?1 AND status = 'idle'",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count idle slots")?;
        Ok(n as usize)
    }

    pub fn count_running_slots(&self, project_id: i64) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM worker_slots WHERE project_id = ?1 AND status = 'running'",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count running slots")?;
        Ok(n as usize)
    }

    /// Atomically claim the lowest idle slot for `card_id`.
    ///
    /// Runs under `BEGIN IMMEDIATE` so a concurrent writer in another
    /// process cannot claim the same slot; the conditional `UPDATE` is the
    /// compare-and-swap.
    pub fn acquire_idle_slot(
        &self,
        project_id: i64,
        card_id: i64,
        now: DateTime<Utc>,
    ) -> Result<SlotClaim> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin slot acquisition")?;
        let candidate: Option<i64> = tx
            .query_row(
                "SELECT slot_number FROM worker_slots
                 WHERE project_id = ?1 AND status = 'idle'
                 ORDER BY slot_number LIMIT 1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to find idle slot")?;
        let Some(slot_number) = candidate else {
            return Ok(SlotClaim::Exhausted);
        };
        let changed = tx
            .execute(
                "UPDATE worker_slots SET status = 'running', card_id = ?1, job_id = NULL,
                        worktree_id = NULL, started_at = ?2
                 WHERE project_id = ?3 AND slot_number = ?4 AND status = 'idle'",
                params![card_id, ts(now), project_id, slot_number],
            )
            .context("Failed to claim slot")?;
        if changed == 0 {
            return Ok(SlotClaim::Contended);
        }
        tx.commit().context("Failed to commit slot acquisition")?;
        let slot = self
            .get_slot(project_id, slot_number)?
            .context("Slot not found after acquisition")?;
        Ok(SlotClaim::Acquired(slot))
    }

    pub fn get_slot(&self, project_id: i64, slot_number: i64) -> Result<Option<Slot>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SLOT_COLUMNS} FROM worker_slots WHERE project_id = ?1 AND slot_number = ?2"
                ),
                params![project_id, slot_number],
                slot_row,
            )
            .optional()
            .context("Failed to query slot")?;
        row.map(SlotRow::into_slot).transpose()
    }

    pub fn assign_slot_job(&self, project_id: i64, slot_number: i64, job_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worker_slots SET job_id = ?1 WHERE project_id = ?2 AND slot_number = ?3",
                params![job_id, project_id, slot_number],
            )
            .context("Failed to assign job to slot")?;
        Ok(())
    }

    pub fn assign_slot_worktree(
        &self,
        project_id: i64,
        slot_number: i64,
        worktree_id: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worker_slots SET worktree_id = ?1 WHERE project_id = ?2 AND slot_number = ?3",
                params![worktree_id, project_id, slot_number],
            )
            .context("Failed to assign worktree to slot")?;
        Ok(())
    }

    /// Return a slot to idle. Idempotent.
    pub fn release_slot(&self, project_id: i64, slot_number: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worker_slots SET status = 'idle', card_id = NULL, job_id = NULL,
                        worktree_id = NULL, started_at = NULL
                 WHERE project_id = ?1 AND slot_number = ?2",
                params![project_id, slot_number],
            )
            .context("Failed to release slot")?;
        Ok(())
    }

    pub fn pool_snapshot(&self, project_id: i64) -> Result<PoolSnapshot> {
        Ok(PoolSnapshot {
            project_id,
            slots: self.list_slots(project_id)?,
            queued_cards: self.count_cards_with_status(project_id, CardStatus::Ready)?,
        })
    }

    // ── Worktrees ─────────────────────────────────────────────────────

    /// Insert or rebind the worktree record for `path`.
    pub fn upsert_worktree(
        &self,
        project_id: i64,
        card_id: i64,
        path: &str,
        branch: &str,
        base_ref: &str,
        status: WorktreeStatus,
    ) -> Result<WorktreeRecord> {
        self.conn
            .execute(
                "INSERT INTO worktrees (project_id, card_id, path, branch, base_ref, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(path) DO UPDATE SET
                    card_id = excluded.card_id,
                    branch = excluded.branch,
                    base_ref = excluded.base_ref,
                    status = excluded.status,
                    cleanup_after = NULL,
                    updated_at = datetime('now')",
                params![project_id, card_id, path, branch, base_ref, status.as_str()],
            )
            .context("Failed to upsert worktree")?;
        self.get_worktree_by_path(path)?
            .context("Worktree not found after upsert")
    }

    pub fn get_worktree(&self, id: i64) -> Result<Option<WorktreeRecord>> {
        self.query_worktree(
            &format!("SELECT {WORKTREE_COLUMNS} FROM worktrees WHERE id = ?1"),
            params![id],
        )
    }

    pub fn get_worktree_by_path(&self, path: &str) -> Result<Option<WorktreeRecord>> {
        self.query_worktree(
            &format!("SELECT {WORKTREE_COLUMNS} FROM worktrees WHERE path = ?1"),
            params![path],
        )
    }

    /// The most recent non-cleaned worktree bound to a card.
    pub fn get_worktree_for_card(&self, card_id: i64) -> Result<Option<WorktreeRecord>> {
        self.query_worktree(
            &format!(
                "SELECT {WORKTREE_COLUMNS} FROM worktrees
                 WHERE card_id = ?1 AND status != 'cleaned'
                 ORDER BY id DESC LIMIT 1"
            ),
            params![card_id],
        )
    }

    pub fn update_worktree_status(&self, id: i64, status: WorktreeStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worktrees SET status = ?1, cleanup_after = NULL, updated_at = datetime('now')
                 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update worktree status")?;
        Ok(())
    }

    /// Mark a worktree for removal by the sweep once `delay` has passed.
    pub fn schedule_worktree_cleanup(
        &self,
        id: i64,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worktrees SET status = 'cleanup_pending', cleanup_after = ?1,
                        updated_at = datetime('now')
                 WHERE id = ?2",
                params![ts(after(now, delay)), id],
            )
            .context("Failed to schedule worktree cleanup")?;
        Ok(())
    }

    /// `cleanup_pending` worktrees whose delay has elapsed and that are not
    /// held by an unexpired lock.
    pub fn list_cleanup_due(&self, project_id: i64, now: DateTime<Utc>) -> Result<Vec<WorktreeRecord>> {
        let now = ts(now);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {WORKTREE_COLUMNS} FROM worktrees
                 WHERE project_id = ?1 AND status = 'cleanup_pending'
                   AND (cleanup_after IS NULL OR cleanup_after <= ?2)
                   AND (lock_holder IS NULL OR lock_expires_at IS NULL OR lock_expires_at < ?2)
                 ORDER BY id"
            ))
            .context("Failed to prepare list_cleanup_due")?;
        let rows = stmt
            .query_map(params![project_id, now], worktree_row)
            .context("Failed to query cleanup-due worktrees")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read worktree row")?.into_worktree()?);
        }
        Ok(out)
    }

    pub fn count_active_worktrees(&self, project_id: i64) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM worktrees WHERE project_id = ?1 AND status IN ('creating', 'running')",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count active worktrees")?;
        Ok(n as usize)
    }

    /// Atomically take the worktree lock for `holder`.
    ///
    /// Succeeds when the lock is free, expired, or already held by `holder`
    /// (re-entrant renewal). The expiry is persisted so a crashed holder
    /// releases implicitly once `ttl` elapses.
    pub fn acquire_worktree_lock(
        &self,
        id: i64,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin worktree lock")?;
        let changed = tx
            .execute(
                "UPDATE worktrees SET lock_holder = ?1, lock_expires_at = ?2
                 WHERE id = ?3
                   AND (lock_holder IS NULL OR lock_holder = ?1
                        OR lock_expires_at IS NULL OR lock_expires_at < ?4)",
                params![holder, ts(after(now, ttl)), id, ts(now)],
            )
            .context("Failed to acquire worktree lock")?;
        tx.commit().context("Failed to commit worktree lock")?;
        Ok(changed == 1)
    }

    /// Release the lock only if `holder` still owns it.
    pub fn release_worktree_lock(&self, id: i64, holder: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE worktrees SET lock_holder = NULL, lock_expires_at = NULL
                 WHERE id = ?1 AND lock_holder = ?2",
                params![id, holder],
            )
            .context("Failed to release worktree lock")?;
        Ok(changed == 1)
    }

    fn query_worktree(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<WorktreeRecord>> {
        let row = self
            .conn
            .query_row(sql, params, worktree_row)
            .optional()
            .context("Failed to query worktree")?;
        row.map(WorktreeRow::into_worktree).transpose()
    }

    // ── Progress checkpoints ──────────────────────────────────────────

    pub fn save_checkpoint(&self, checkpoint: &ProgressCheckpoint) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO progress_checkpoints
                    (job_id, card_id, phase, iteration, completed_subtasks, context_summary, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(job_id) DO UPDATE SET
                    phase = excluded.phase,
                    iteration = excluded.iteration,
                    completed_subtasks = excluded.completed_subtasks,
                    context_summary = excluded.context_summary,
                    updated_at = excluded.updated_at",
                params![
                    checkpoint.job_id,
                    checkpoint.card_id,
                    checkpoint.phase,
                    checkpoint.iteration,
                    checkpoint.completed_subtasks,
                    checkpoint.context_summary,
                    ts(checkpoint.updated_at),
                ],
            )
            .context("Failed to save checkpoint")?;
        Ok(())
    }

    pub fn get_checkpoint(&self, job_id: i64) -> Result<Option<ProgressCheckpoint>> {
        self.query_checkpoint(
            "SELECT job_id, card_id, phase, iteration, completed_subtasks, context_summary, updated_at
             FROM progress_checkpoints WHERE job_id = ?1",
            params![job_id],
        )
    }

    /// Latest checkpoint for a card left by a job other than `exclude_job`.
    pub fn latest_checkpoint_for_card(
        &self,
        card_id: i64,
        exclude_job: i64,
    ) -> Result<Option<ProgressCheckpoint>> {
        self.query_checkpoint(
            "SELECT job_id, card_id, phase, iteration, completed_subtasks, context_summary, updated_at
             FROM progress_checkpoints WHERE card_id = ?1 AND job_id != ?2
             ORDER BY updated_at DESC, job_id DESC LIMIT 1",
            params![card_id, exclude_job],
        )
    }

    fn query_checkpoint(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<ProgressCheckpoint>> {
        let row = self
            .conn
            .query_row(sql, params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()
            .context("Failed to query checkpoint")?;
        row.map(|(job_id, card_id, phase, iteration, completed, summary, updated)| {
            Ok(ProgressCheckpoint {
                job_id,
                card_id,
                phase,
                iteration,
                completed_subtasks: completed,
                context_summary: summary,
                updated_at: parse_ts(Some(updated))?.context("Checkpoint without timestamp")?,
            })
        })
        .transpose()
    }

    // ── Subtasks ──────────────────────────────────────────────────────

    /// Persist a decomposition. Positions start at 1.
    pub fn create_subtasks(&self, card_id: i64, items: &[(String, String)]) -> Result<Vec<Subtask>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin subtask insert")?;
        tx.execute("DELETE FROM subtasks WHERE card_id = ?1", params![card_id])
            .context("Failed to clear subtasks")?;
        for (i, (title, description)) in items.iter().enumerate() {
            tx.execute(
                "INSERT INTO subtasks (card_id, position, title, description) VALUES (?1, ?2, ?3, ?4)",
                params![card_id, (i + 1) as i64, title, description],
            )
            .context("Failed to insert subtask")?;
        }
        tx.commit().context("Failed to commit subtasks")?;
        self.list_subtasks(card_id)
    }

    pub fn list_subtasks(&self, card_id: i64) -> Result<Vec<Subtask>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, card_id, position, title, description, status, remote_issue_number
                 FROM subtasks WHERE card_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare list_subtasks")?;
        let rows = stmt
            .query_map(params![card_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            })
            .context("Failed to query subtasks")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, card_id, position, title, description, status, remote) =
                row.context("Failed to read subtask row")?;
            out.push(Subtask {
                id,
                card_id,
                position,
                title,
                description,
                status: SubtaskStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?,
                remote_issue_number: remote,
            });
        }
        Ok(out)
    }

    /// Mark subtask `position` of a card completed. Returns false if it was
    /// unknown or already completed.
    pub fn complete_subtask(&self, card_id: i64, position: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE subtasks SET status = 'completed'
                 WHERE card_id = ?1 AND position = ?2 AND status = 'pending'",
                params![card_id, position],
            )
            .context("Failed to complete subtask")?;
        Ok(changed == 1)
    }

    pub fn set_subtask_remote_issue(&self, id: i64, number: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE subtasks SET remote_issue_number = ?1 WHERE id = ?2",
                params![number, id],
            )
            .context("Failed to set subtask remote issue")?;
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn project_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        remote_repo: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const CARD_COLUMNS: &str = "id, project_id, title, description, status, labels, remote_issue_number, last_failed_at, created_at, updated_at";

/// Intermediate row struct for reading cards before converting status,
/// labels and timestamps into typed values.
struct CardRow {
    id: i64,
    project_id: i64,
    title: String,
    description: String,
    status: String,
    labels: String,
    remote_issue_number: Option<i64>,
    last_failed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn card_row(row: &Row<'_>) -> rusqlite::Result<CardRow> {
    Ok(CardRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        labels: row.get(5)?,
        remote_issue_number: row.get(6)?,
        last_failed_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl CardRow {
    fn into_card(self) -> Result<Card> {
        let status = CardStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse card status")?;
        let labels: Vec<String> =
            serde_json::from_str(&self.labels).context("Failed to parse card labels JSON")?;
        Ok(Card {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            status,
            labels,
            remote_issue_number: self.remote_issue_number,
            last_failed_at: parse_ts(self.last_failed_at)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, project_id, card_id, job_type, state, lease_expires_at, attempts, result, error, created_at, started_at, finished_at";

struct JobRow {
    id: i64,
    project_id: i64,
    card_id: Option<i64>,
    job_type: String,
    state: String,
    lease_expires_at: Option<String>,
    attempts: i64,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

fn job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        card_id: row.get(2)?,
        job_type: row.get(3)?,
        state: row.get(4)?,
        lease_expires_at: row.get(5)?,
        attempts: row.get(6)?,
        result: row.get(7)?,
        error: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let job_type = JobType::from_str(&self.job_type).map_err(|e| anyhow::anyhow!(e))?;
        let state = JobState::from_str(&self.state).map_err(|e| anyhow::anyhow!(e))?;
        let result = self
            .result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .context("Failed to parse job result JSON")?;
        Ok(Job {
            id: self.id,
            project_id: self.project_id,
            card_id: self.card_id,
            job_type,
            state,
            lease_expires_at: parse_ts(self.lease_expires_at)?,
            attempts: self.attempts,
            result,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

const SLOT_COLUMNS: &str = "project_id, slot_number, status, card_id, job_id, worktree_id, started_at";

struct SlotRow {
    project_id: i64,
    slot_number: i64,
    status: String,
    card_id: Option<i64>,
    job_id: Option<i64>,
    worktree_id: Option<i64>,
    started_at: Option<String>,
}

fn slot_row(row: &Row<'_>) -> rusqlite::Result<SlotRow> {
    Ok(SlotRow {
        project_id: row.get(0)?,
        slot_number: row.get(1)?,
        status: row.get(2)?,
        card_id: row.get(3)?,
        job_id: row.get(4)?,
        worktree_id: row.get(5)?,
        started_at: row.get(6)?,
    })
}

impl SlotRow {
    fn into_slot(self) -> Result<Slot> {
        Ok(Slot {
            project_id: self.project_id,
            slot_number: self.slot_number,
            status: SlotStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            card_id: self.card_id,
            job_id: self.job_id,
            worktree_id: self.worktree_id,
            started_at: parse_ts(self.started_at)?,
        })
    }
}

const WORKTREE_COLUMNS: &str = "id, project_id, card_id, path, branch, base_ref, status, lock_holder, lock_expires_at, created_at, updated_at";

struct WorktreeRow {
    id: i64,
    project_id: i64,
    card_id: i64,
    path: String,
    branch: String,
    base_ref: String,
    status: String,
    lock_holder: Option<String>,
    lock_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn worktree_row(row: &Row<'_>) -> rusqlite::Result<WorktreeRow> {
    Ok(WorktreeRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        card_id: row.get(2)?,
        path: row.get(3)?,
        branch: row.get(4)?,
        base_ref: row.get(5)?,
        status: row.get(6)?,
        lock_holder: row.get(7)?,
        lock_expires_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl WorktreeRow {
    fn into_worktree(self) -> Result<WorktreeRecord> {
        Ok(WorktreeRecord {
            id: self.id,
            project_id: self.project_id,
            card_id: self.card_id,
            path: self.path,
            branch: self.branch,
            base_ref: self.base_ref,
            status: WorktreeStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            lock_holder: self.lock_holder,
            lock_expires_at: parse_ts(self.lock_expires_at)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Result<(FactoryDb, Project)> {
        let db = FactoryDb::new_in_memory()?;
        let project = db.create_project("demo", "/tmp/demo")?;
        Ok((db, project))
    }

    #[test]
    fn test_migrations_create_all_tables() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('projects', 'cards', 'jobs', 'worktrees', 'worker_slots', 'progress_checkpoints', 'subtasks')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 7);
        // Re-running migrations is a no-op.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_project_lookup_by_path() -> Result<()> {
        let (db, project) = setup()?;
        let found = db.find_project_by_path("/tmp/demo")?.unwrap();
        assert_eq!(found.id, project.id);
        assert!(db.find_project_by_path("/tmp/other")?.is_none());
        let updated = db.update_project_remote(project.id, Some("acme/demo"))?;
        assert_eq!(updated.remote_repo.as_deref(), Some("acme/demo"));
        Ok(())
    }

    #[test]
    fn test_card_crud_and_cas() -> Result<()> {
        let (db, project) = setup()?;
        let card = db.create_card(project.id, "Add login", "OAuth flow", CardStatus::Draft)?;
        assert_eq!(card.status, CardStatus::Draft);
        assert!(card.labels.is_empty());

        assert!(!db.transition_card_status(card.id, CardStatus::Ready, CardStatus::InProgress)?);
        assert!(db.transition_card_status(card.id, CardStatus::Draft, CardStatus::Ready)?);
        assert_eq!(db.get_card_status(card.id)?, Some(CardStatus::Ready));

        db.set_card_labels(card.id, &["foundry:ready".to_string()])?;
        db.set_card_remote_issue(card.id, 42)?;
        let found = db.find_card_by_remote_issue(project.id, 42)?.unwrap();
        assert_eq!(found.id, card.id);
        assert_eq!(found.labels, vec!["foundry:ready".to_string()]);
        Ok(())
    }

    #[test]
    fn test_update_missing_card_errors() -> Result<()> {
        let (db, _) = setup()?;
        assert!(db.update_card_status(999, CardStatus::Ready).is_err());
        Ok(())
    }

    #[test]
    fn test_eligible_cards_respect_cooldown_and_active_jobs() -> Result<()> {
        let (db, project) = setup()?;
        let now = Utc::now();
        let fresh = db.create_card(project.id, "fresh", "", CardStatus::Ready)?;
        let cooling = db.create_card(project.id, "cooling", "", CardStatus::InProgress)?;
        let busy = db.create_card(project.id, "busy", "", CardStatus::Ready)?;
        db.create_card(project.id, "draft", "", CardStatus::Draft)?;

        assert!(db.mark_card_failed(cooling.id, now - chrono::Duration::minutes(10))?);
        db.create_job(project.id, Some(busy.id), JobType::AgentRun)?;

        let cooldown = Duration::from_secs(30 * 60);
        let eligible = db.list_eligible_cards(project.id, 10, cooldown, now)?;
        let ids: Vec<i64> = eligible.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![fresh.id]);

        // After the cooldown window the failed card is eligible again.
        let later = now + chrono::Duration::minutes(25);
        let eligible = db.list_eligible_cards(project.id, 10, cooldown, later)?;
        assert_eq!(eligible.len(), 2);

        let limited = db.list_eligible_cards(project.id, 1, cooldown, later)?;
        assert_eq!(limited.len(), 1);
        Ok(())
    }

    #[test]
    fn test_job_lifecycle() -> Result<()> {
        let (db, project) = setup()?;
        let card = db.create_card(project.id, "c", "", CardStatus::Ready)?;
        let job = db.create_job(project.id, Some(card.id), JobType::AgentRun)?;
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);

        let lease = Duration::from_secs(300);
        let job = db.transition_job(job.id, JobState::Running, None, None, lease)?;
        assert_eq!(job.attempts, 1);
        assert!(job.lease_expires_at.is_some());
        assert!(job.started_at.is_some());

        let payload = serde_json::json!({"pr_url": "https://example.com/pr/1"});
        let job = db.transition_job(job.id, JobState::Succeeded, None, Some(&payload), lease)?;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.result, Some(payload));
        assert!(job.finished_at.is_some());
        assert!(job.lease_expires_at.is_none());

        // Terminal states are final.
        assert!(db.transition_job(job.id, JobState::Running, None, None, lease).is_err());
        Ok(())
    }

    #[test]
    fn test_cancel_job_only_when_live() -> Result<()> {
        let (db, project) = setup()?;
        let job = db.create_job(project.id, None, JobType::SyncPoll)?;
        assert!(db.cancel_job(job.id, "operator")?);
        assert_eq!(db.get_job_state(job.id)?, Some(JobState::Canceled));
        assert!(!db.cancel_job(job.id, "again")?);
        assert_eq!(db.get_job(job.id)?.unwrap().error.as_deref(), Some("operator"));
        Ok(())
    }

    #[test]
    fn test_lease_renewal_and_expiry() -> Result<()> {
        let (db, project) = setup()?;
        let a = db.create_job(project.id, None, JobType::AgentRun)?;
        let b = db.create_job(project.id, None, JobType::AgentRun)?;
        let ttl = Duration::from_secs(60);
        db.transition_job(a.id, JobState::Running, None, None, ttl)?;
        db.transition_job(b.id, JobState::Running, None, None, ttl)?;

        let now = Utc::now();
        assert!(db.renew_lease(a.id, ttl, now)?);

        let later = now + chrono::Duration::minutes(5);
        let failed = db.fail_expired_leases(project.id, later, &[b.id])?;
        assert_eq!(failed, vec![a.id]);
        assert_eq!(db.get_job_state(a.id)?, Some(JobState::Failed));
        assert_eq!(db.get_job_state(b.id)?, Some(JobState::Running));
        assert!(!db.renew_lease(a.id, ttl, later)?);
        Ok(())
    }

    #[test]
    fn test_slot_acquisition_is_bounded() -> Result<()> {
        let (db, project) = setup()?;
        db.init_slots(project.id, 2)?;
        assert_eq!(db.count_idle_slots(project.id)?, 2);

        let now = Utc::now();
        let first = db.acquire_idle_slot(project.id, 1, now)?;
        let second = db.acquire_idle_slot(project.id, 2, now)?;
        let third = db.acquire_idle_slot(project.id, 3, now)?;
        let SlotClaim::Acquired(first) = first else { panic!("expected slot") };
        assert!(matches!(second, SlotClaim::Acquired(_)));
        assert!(matches!(third, SlotClaim::Exhausted));
        assert_eq!(first.slot_number, 1);
        assert_eq!(first.status, SlotStatus::Running);
        assert_eq!(db.count_running_slots(project.id)?, 2);

        db.release_slot(project.id, first.slot_number)?;
        db.release_slot(project.id, first.slot_number)?;
        assert_eq!(db.count_idle_slots(project.id)?, 1);
        assert!(matches!(
            db.acquire_idle_slot(project.id, 3, now)?,
            SlotClaim::Acquired(_)
        ));
        Ok(())
    }

    #[test]
    fn test_init_slots_shrinks_only_idle() -> Result<()> {
        let (db, project) = setup()?;
        db.init_slots(project.id, 4)?;
        // Occupy slots 1..=4 so slot 4 is running when we shrink.
        for card in 1..=4 {
            db.acquire_idle_slot(project.id, card, Utc::now())?;
        }
        db.release_slot(project.id, 3)?;
        db.init_slots(project.id, 2)?;
        let numbers: Vec<i64> = db.list_slots(project.id)?.iter().map(|s| s.slot_number).collect();
        assert_eq!(numbers, vec![1, 2, 4]);
        Ok(())
    }

    #[test]
    fn test_worktree_lock_is_exclusive_until_expiry() -> Result<()> {
        let (db, project) = setup()?;
        let card = db.create_card(project.id, "c", "", CardStatus::Ready)?;
        let wt = db.upsert_worktree(
            project.id,
            card.id,
            "/tmp/demo/.foundry/worktrees/card-1",
            "foundry/card-1",
            "main",
            WorktreeStatus::Creating,
        )?;
        let ttl = Duration::from_secs(900);
        let now = Utc::now();
        assert!(db.acquire_worktree_lock(wt.id, "job-1", ttl, now)?);
        assert!(db.acquire_worktree_lock(wt.id, "job-1", ttl, now)?);
        assert!(!db.acquire_worktree_lock(wt.id, "job-2", ttl, now)?);

        // Expired lock can be taken over.
        let later = now + chrono::Duration::minutes(16);
        assert!(db.acquire_worktree_lock(wt.id, "job-2", ttl, later)?);
        assert!(!db.release_worktree_lock(wt.id, "job-1")?);
        assert!(db.release_worktree_lock(wt.id, "job-2")?);
        assert!(db.get_worktree(wt.id)?.unwrap().lock_holder.is_none());
        Ok(())
    }

    #[test]
    fn test_worktree_upsert_rebinds_path() -> Result<()> {
        let (db, project) = setup()?;
        let a = db.create_card(project.id, "a", "", CardStatus::Ready)?;
        let path = "/tmp/demo/.foundry/worktrees/x";
        let first = db.upsert_worktree(project.id, a.id, path, "b1", "main", WorktreeStatus::Creating)?;
        let second = db.upsert_worktree(project.id, a.id, path, "b1", "main", WorktreeStatus::Running)?;
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, WorktreeStatus::Running);
        assert_eq!(db.count_active_worktrees(project.id)?, 1);
        assert_eq!(db.get_worktree_for_card(a.id)?.unwrap().id, first.id);

        db.update_worktree_status(first.id, WorktreeStatus::Cleaned)?;
        assert!(db.get_worktree_for_card(a.id)?.is_none());
        assert_eq!(db.count_active_worktrees(project.id)?, 0);
        Ok(())
    }

    #[test]
    fn test_cleanup_due_honours_delay_and_locks() -> Result<()> {
        let (db, project) = setup()?;
        let card = db.create_card(project.id, "c", "", CardStatus::Ready)?;
        let wt = db.upsert_worktree(project.id, card.id, "/tmp/wt", "b", "main", WorktreeStatus::Ready)?;
        let now = Utc::now();
        db.schedule_worktree_cleanup(wt.id, Duration::from_secs(3600), now)?;
        assert!(db.list_cleanup_due(project.id, now)?.is_empty());

        let later = now + chrono::Duration::minutes(61);
        assert_eq!(db.list_cleanup_due(project.id, later)?.len(), 1);

        db.acquire_worktree_lock(wt.id, "job-9", Duration::from_secs(7200), later)?;
        assert!(db.list_cleanup_due(project.id, later)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_checkpoints_resume_from_previous_job() -> Result<()> {
        let (db, project) = setup()?;
        let card = db.create_card(project.id, "c", "", CardStatus::Ready)?;
        let j1 = db.create_job(project.id, Some(card.id), JobType::AgentRun)?;
        let j2 = db.create_job(project.id, Some(card.id), JobType::AgentRun)?;

        let mut cp = ProgressCheckpoint {
            job_id: j1.id,
            card_id: card.id,
            phase: "ai".into(),
            iteration: 1,
            completed_subtasks: 0,
            context_summary: "scaffolded module".into(),
            updated_at: Utc::now(),
        };
        db.save_checkpoint(&cp)?;
        cp.iteration = 2;
        db.save_checkpoint(&cp)?;

        let got = db.get_checkpoint(j1.id)?.unwrap();
        assert_eq!(got.iteration, 2);
        let prior = db.latest_checkpoint_for_card(card.id, j2.id)?.unwrap();
        assert_eq!(prior.job_id, j1.id);
        assert!(db.latest_checkpoint_for_card(card.id, j1.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_subtasks() -> Result<()> {
        let (db, project) = setup()?;
        let card = db.create_card(project.id, "c", "", CardStatus::Ready)?;
        let items = vec![
            ("schema".to_string(), "add table".to_string()),
            ("api".to_string(), "expose endpoint".to_string()),
        ];
        let subtasks = db.create_subtasks(card.id, &items)?;
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].position, 1);

        assert!(db.complete_subtask(card.id, 2)?);
        assert!(!db.complete_subtask(card.id, 2)?);
        assert!(!db.complete_subtask(card.id, 7)?);
        let statuses: Vec<SubtaskStatus> =
            db.list_subtasks(card.id)?.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![SubtaskStatus::Pending, SubtaskStatus::Completed]);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(FactoryDb::new_in_memory()?);
        let project = handle
            .call(|db| db.create_project("p", "/tmp/p"))
            .await?;
        let snapshot = handle
            .call(move |db| {
                db.init_slots(project.id, 3)?;
                db.pool_snapshot(project.id)
            })
            .await?;
        assert_eq!(snapshot.slots.len(), 3);
        assert_eq!(snapshot.queued_cards, 0);
        Ok(())
    }
}
