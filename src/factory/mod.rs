//! Foundry worker engine.
//!
//! ## Module Map
//!
//! ```text
//!   PoolRegistry ──(per project)──> WorkerPool ──(per slot)──> WorkerPipeline
//!        │                              │                            │
//!        │ SyncLockRegistry             │ poll / orphan sweep        │ phases
//!        v                              v                            v
//!   SyncScheduler ── SyncLock ──── DbHandle (SQLite) ───── WorktreeManager
//!                                                           process runner
//!                                                           AgentTool / RemoteTracker
//! ```
//!
//! | Module      | Responsibility                                             |
//! |-------------|------------------------------------------------------------|
//! | `pool`      | Slots, adaptive polling, orphan recovery, `PoolRegistry`   |
//! | `pipeline`  | Per-job phase state machine, lease keepalive, cleanup      |
//! | `worktree`  | Isolated checkouts with path-safety and branch binding     |
//! | `sync_lock` | Shared-worker / exclusive-sync cooperative lock            |
//! | `process`   | Streaming subprocess runner with timeout and cancellation  |
//! | `scheduler` | Periodic tracker sync under the exclusive lock             |
//! | `db`        | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)        |
//! | `agent`     | AI CLI adapters and provider selection                     |
//! | `tracker`   | Remote issue/PR adapters (`gh`, `glab`)                    |
//! | `events`    | `FactoryEvent` + `broadcast_message()`                     |
//!
//! Cancellation reaches a run two ways: the in-process token held by the
//! pool, and the persisted job state / card status, which the pipeline
//! re-reads at every phase boundary and the process runner polls every
//! 500ms.

pub mod agent;
pub mod cancel;
pub mod db;
pub mod events;
pub mod git;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod process;
pub mod prompt;
pub mod scheduler;
pub mod signals;
pub mod sync_lock;
pub mod tracker;
pub mod worktree;

#[cfg(test)]
mod testutil;

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::FoundryConfig;
use db::{DbHandle, FactoryDb};
use models::Project;

/// Open (creating if needed) the project's database.
pub fn open_db(config: &FoundryConfig) -> Result<DbHandle> {
    config.ensure_directories()?;
    let db = FactoryDb::new(&config.db_path())
        .with_context(|| format!("Failed to open database at {}", config.db_path().display()))?;
    Ok(DbHandle::new(db))
}

/// The project row for `path`, registered on first use.
pub async fn ensure_project(db: &DbHandle, path: &Path) -> Result<Project> {
    let path_str = path.to_string_lossy().to_string();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    db.call(move |db| match db.find_project_by_path(&path_str)? {
        Some(project) => Ok(project),
        None => db.create_project(&name, &path_str),
    })
    .await
}
