//! Factory inspection and maintenance: `foundry status`, `cancel`, `cleanup`.

use anyhow::{Result, bail};
use serde::Serialize;

use foundry::factory::models::{Card, Job, PoolSnapshot};
use foundry::factory::pool::cleanup_due_worktrees;
use foundry::factory::worktree::WorktreeManager;

use super::open_project;

const RECENT_JOBS: usize = 10;

#[derive(Serialize)]
struct StatusReport {
    project: String,
    pool: PoolSnapshot,
    cards: Vec<Card>,
    jobs: Vec<Job>,
}

pub async fn cmd_status(project_dir: &std::path::Path, json: bool) -> Result<()> {
    let (_, db, project) = open_project(project_dir).await?;
    let pid = project.id;
    let (pool, cards, jobs) = db
        .call(move |db| Ok((db.pool_snapshot(pid)?, db.list_cards(pid)?, db.list_jobs(pid, RECENT_JOBS)?)))
        .await?;

    if json {
        let report = StatusReport {
            project: project.name,
            pool,
            cards,
            jobs,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Project: {} ({})", project.name, project.path);
    println!();
    println!("Slots ({} queued card(s)):", pool.queued_cards);
    if pool.slots.is_empty() {
        println!("  (none; pool has not started)");
    }
    for slot in &pool.slots {
        let detail = match (slot.card_id, slot.job_id) {
            (Some(card), Some(job)) => format!("card #{} job #{}", card, job),
            (Some(card), None) => format!("card #{}", card),
            _ => String::new(),
        };
        println!("  [{}] {:<8} {}", slot.slot_number, slot.status.as_str(), detail);
    }

    println!();
    println!("Cards:");
    if cards.is_empty() {
        println!("  (none)");
    }
    for card in &cards {
        let issue = card
            .remote_issue_number
            .map(|n| format!(" (#{} upstream)", n))
            .unwrap_or_default();
        println!("  #{:<4} {:<12} {}{}", card.id, card.status.to_string(), card.title, issue);
    }

    println!();
    println!("Recent jobs:");
    if jobs.is_empty() {
        println!("  (none)");
    }
    for job in &jobs {
        let card = job.card_id.map(|c| format!("card #{}", c)).unwrap_or_default();
        let error = job.error.as_deref().map(|e| format!(" - {}", e)).unwrap_or_default();
        println!("  #{:<4} {:<10} {:<10} {}{}", job.id, job.state.to_string(), job.job_type.as_str(), card, error);
    }
    Ok(())
}

/// Mark a job canceled. A pool running in another process notices on its
/// next cancel probe.
pub async fn cmd_cancel(project_dir: &std::path::Path, job_id: i64) -> Result<()> {
    let (_, db, project) = open_project(project_dir).await?;
    let job = db.call(move |db| db.get_job(job_id)).await?;
    let Some(job) = job.filter(|j| j.project_id == project.id) else {
        bail!("Job #{} not found", job_id);
    };
    let canceled = db
        .call(move |db| db.cancel_job(job_id, "canceled from CLI"))
        .await?;
    if canceled {
        println!("Job #{} canceled", job_id);
    } else {
        println!("Job #{} is already {}", job_id, job.state);
    }
    Ok(())
}

pub async fn cmd_cleanup(project_dir: &std::path::Path) -> Result<()> {
    let (config, db, project) = open_project(project_dir).await?;
    let toml = &config.toml;
    let manager = WorktreeManager::new(
        &config.project_dir,
        toml.worktree_root(&config.project_dir),
        toml.git.remote.clone(),
        toml.git_timeout(),
    );
    let removed = cleanup_due_worktrees(&db, &manager, project.id).await?;
    if let Err(e) = manager.prune().await {
        tracing::warn!(error = %e, "git worktree prune failed");
    }
    println!("Removed {} expired worktree(s)", removed);
    Ok(())
}
