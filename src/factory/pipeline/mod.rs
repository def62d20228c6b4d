//! Worker pipeline.
//!
//! One `WorkerPipeline::run` drives a single job through the phase state
//! machine in [`context::Phase`]. Before every phase after `init` the card
//! status and the persisted job state are re-read; a mismatch ends the run
//! as canceled. A background keepalive renews the job lease (and the
//! worktree lock, once one is held) while the run is in flight. Cleanup and
//! slot release run whatever the outcome.

pub mod context;
pub mod phases;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use context::{Phase, PipelineContext, PipelineEnv, Workspace};
use phases::{Step, emit, run_phase};

use crate::errors::PipelineError;
use crate::factory::cancel::{CancelSignal, JobStateProbe};
use crate::factory::events::FactoryEvent;
use crate::factory::models::{Card, CardStatus, JobState, ProgressCheckpoint, Project};
use crate::factory::process::{LineLogger, tracing_logger};

/// How a run ended. Cancellation is an outcome, not an error.
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    Canceled(String),
    Failed(PipelineError),
}

/// What the pool hands to a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub project: Project,
    pub card: Card,
    pub job_id: i64,
    pub slot_number: i64,
}

/// Terminal result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    /// Last phase entered.
    pub phase: String,
    pub error: Option<String>,
    pub pr_url: Option<String>,
    pub logs: Vec<String>,
    pub visited: Vec<Phase>,
    pub canceled: bool,
    pub fallback_used: bool,
}

/// Starts a pipeline for a claimed slot. The pool only sees this seam, so
/// tests can substitute runs that never touch git.
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    async fn launch(&self, request: PipelineRequest, token: CancellationToken) -> PipelineResult;
}

pub struct WorkerPipeline {
    env: Arc<PipelineEnv>,
}

impl WorkerPipeline {
    pub fn new(env: Arc<PipelineEnv>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Arc<PipelineEnv> {
        &self.env
    }

    pub async fn run(&self, request: PipelineRequest, token: CancellationToken) -> PipelineResult {
        let job_id = request.job_id;
        let probe = Arc::new(JobStateProbe::new(self.env.db.clone(), job_id));
        let cancel = CancelSignal::new(token, Some(probe));
        let logger = tracing_logger(format!("job-{}", job_id));

        let worktree_id = Arc::new(AtomicI64::new(0));
        let keepalive_stop = CancellationToken::new();
        let keepalive = tokio::spawn(keepalive(
            self.env.clone(),
            job_id,
            worktree_id.clone(),
            keepalive_stop.clone(),
        ));

        let ctx = PipelineContext::new(
            self.env.clone(),
            request.project,
            request.card,
            job_id,
            request.slot_number,
        );
        let (ctx, visited, outcome) = drive(ctx, &cancel, &logger, &worktree_id).await;

        keepalive_stop.cancel();
        if let Err(e) = keepalive.await {
            tracing::warn!(job_id, error = %e, "lease keepalive task panicked");
        }

        let ctx = phases::cleanup(ctx, &outcome).await;
        finalize(ctx, visited, outcome).await
    }
}

#[async_trait]
impl PipelineLauncher for WorkerPipeline {
    async fn launch(&self, request: PipelineRequest, token: CancellationToken) -> PipelineResult {
        self.run(request, token).await
    }
}

/// Run phases until a terminal step. The returned context is the last one
/// a phase produced, so cleanup sees every resource acquired so far.
async fn drive(
    mut ctx: PipelineContext,
    cancel: &CancelSignal,
    logger: &LineLogger,
    worktree_id: &AtomicI64,
) -> (PipelineContext, Vec<Phase>, Outcome) {
    let decomposition = ctx.config().decomposition.enabled;
    let mut visited = Vec::new();
    let mut phase = Phase::Init;

    loop {
        if phase != Phase::Init {
            match gate(&ctx, phase, cancel).await {
                Ok(None) => {}
                Ok(Some(reason)) => return (ctx, visited, Outcome::Canceled(reason)),
                Err(e) => return (ctx, visited, Outcome::Failed(e)),
            }
        }
        visited.push(phase);
        record_phase(&ctx, phase).await;

        match run_phase(phase, &ctx, cancel, logger).await {
            Step::Continue(next) => {
                ctx = next;
                if let Some(Workspace::Worktree { record_id, .. }) = &ctx.workspace {
                    worktree_id.store(*record_id, Ordering::Relaxed);
                }
            }
            Step::Done(next) => return (next, visited, Outcome::Succeeded),
            Step::Canceled(reason) => return (ctx, visited, Outcome::Canceled(reason)),
            Step::Failed(e) => return (ctx, visited, Outcome::Failed(e)),
        }

        match phase.next(decomposition) {
            Some(next) => phase = next,
            None => return (ctx, visited, Outcome::Succeeded),
        }
    }
}

/// `Some(reason)` when the run must not enter `phase`.
async fn gate(
    ctx: &PipelineContext,
    phase: Phase,
    cancel: &CancelSignal,
) -> Result<Option<String>, PipelineError> {
    if cancel.token().is_cancelled() {
        return Ok(Some(format!("canceled before {}", phase)));
    }
    let (job_id, card_id) = (ctx.job_id, ctx.card.id);
    let (state, status) = ctx
        .env
        .db
        .call(move |db| Ok((db.get_job_state(job_id)?, db.get_card_status(card_id)?)))
        .await?;
    let state = state.ok_or(PipelineError::JobNotFound { job_id })?;
    let status = status.ok_or(PipelineError::CardNotFound { card_id })?;

    if state == JobState::Canceled {
        return Ok(Some(format!("job {} was canceled before {}", job_id, phase)));
    }
    let allowed = phase.allowed_statuses();
    if !allowed.contains(&status) {
        return Ok(Some(format!(
            "card {} is {} but {} requires {}",
            card_id,
            status,
            phase,
            allowed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or ")
        )));
    }
    Ok(None)
}

/// Persist a checkpoint for the phase transition and announce it.
async fn record_phase(ctx: &PipelineContext, phase: Phase) {
    let checkpoint = ProgressCheckpoint {
        job_id: ctx.job_id,
        card_id: ctx.card.id,
        phase: phase.to_string(),
        iteration: ctx.iteration as i64,
        completed_subtasks: ctx.completed_subtasks() as i64,
        context_summary: ctx.carryover.clone().unwrap_or_default(),
        updated_at: Utc::now(),
    };
    if let Err(e) = ctx.env.db.call(move |db| db.save_checkpoint(&checkpoint)).await {
        tracing::warn!(job_id = ctx.job_id, %phase, error = %e, "failed to save checkpoint");
    }
    tracing::info!(job_id = ctx.job_id, card_id = ctx.card.id, %phase, "entering phase");
    emit(
        ctx,
        FactoryEvent::PhaseStarted {
            job_id: ctx.job_id,
            card_id: ctx.card.id,
            phase: phase.to_string(),
        },
    );
}

/// Renew the job lease and, when set, the worktree lock until `stop` fires.
async fn keepalive(env: Arc<PipelineEnv>, job_id: i64, worktree_id: Arc<AtomicI64>, stop: CancellationToken) {
    let workers = &env.config.workers;
    let every = Duration::from_secs(workers.lease_renew_secs.max(1));
    let lease_ttl = Duration::from_secs(workers.lease_ttl_secs);
    let lock_ttl = Duration::from_secs(env.config.worktrees.lock_ttl_secs);
    let holder = format!("job-{}", job_id);
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let record_id = worktree_id.load(Ordering::Relaxed);
        let holder = holder.clone();
        let renewed = env
            .db
            .call(move |db| {
                let now = Utc::now();
                let lease = db.renew_lease(job_id, lease_ttl, now)?;
                if record_id > 0 {
                    db.acquire_worktree_lock(record_id, &holder, lock_ttl, now)?;
                }
                Ok(lease)
            })
            .await;
        match renewed {
            Ok(true) => tracing::debug!(job_id, "lease renewed"),
            Ok(false) => {
                tracing::debug!(job_id, "job no longer running, stopping keepalive");
                return;
            }
            Err(e) => tracing::warn!(job_id, error = %e, "lease renewal failed"),
        }
    }
}

/// Persist the terminal job state, settle the card and release the slot.
async fn finalize(ctx: PipelineContext, visited: Vec<Phase>, outcome: Outcome) -> PipelineResult {
    let env = ctx.env.clone();
    let (job_id, card_id, project_id, slot) = (ctx.job_id, ctx.card.id, ctx.project.id, ctx.slot_number);
    let lease_ttl = Duration::from_secs(ctx.config().workers.lease_ttl_secs);
    let fallback_used = ctx.ai.as_ref().is_some_and(|ai| ai.fallback_used);
    let phase = visited.last().map(Phase::to_string).unwrap_or_default();

    let (terminal, error) = match &outcome {
        Outcome::Succeeded => {
            let payload = serde_json::json!({
                "branch": ctx.branch,
                "pr_url": ctx.pr.as_ref().map(|p| p.url.clone()),
                "draft": ctx.pr.as_ref().is_some_and(|p| p.draft),
                "failed_checks": ctx.failed_checks,
                "ai": ctx.ai,
                "fallback_used": fallback_used,
            });
            let stored = env
                .db
                .call(move |db| db.transition_job(job_id, JobState::Succeeded, None, Some(&payload), lease_ttl))
                .await;
            if let Err(e) = stored {
                tracing::error!(job_id, error = %e, "failed to record job success");
            }
            (JobState::Succeeded, None)
        }
        Outcome::Failed(err) => {
            let message = format!("{} failed: {}", phase, err);
            tracing::error!(job_id, card_id, %phase, error = %err, "pipeline failed");
            let msg = message.clone();
            let stored = env
                .db
                .call(move |db| {
                    if let Err(e) = db.transition_job(job_id, JobState::Failed, Some(&msg), None, lease_ttl) {
                        tracing::warn!(job_id, error = %e, "job already terminal");
                    }
                    db.mark_card_failed(card_id, Utc::now())
                })
                .await;
            match stored {
                Ok(true) => emit(
                    &ctx,
                    FactoryEvent::CardStatusChanged {
                        card_id,
                        status: CardStatus::Ready,
                    },
                ),
                Ok(false) => {}
                Err(e) => tracing::error!(job_id, error = %e, "failed to record job failure"),
            }
            (JobState::Failed, Some(message))
        }
        Outcome::Canceled(reason) => {
            tracing::info!(job_id, card_id, %phase, reason = %reason, "pipeline canceled");
            let r = reason.clone();
            let stored = env
                .db
                .call(move |db| {
                    db.cancel_job(job_id, &r)?;
                    db.transition_card_status(card_id, CardStatus::InProgress, CardStatus::Ready)
                })
                .await;
            match stored {
                Ok(true) => emit(
                    &ctx,
                    FactoryEvent::CardStatusChanged {
                        card_id,
                        status: CardStatus::Ready,
                    },
                ),
                Ok(false) => {}
                Err(e) => tracing::error!(job_id, error = %e, "failed to record cancellation"),
            }
            (JobState::Canceled, Some(reason.clone()))
        }
    };
    emit(
        &ctx,
        FactoryEvent::JobStateChanged {
            job_id,
            card_id: Some(card_id),
            state: terminal,
        },
    );

    match env.db.call(move |db| db.release_slot(project_id, slot)).await {
        Ok(()) => emit(
            &ctx,
            FactoryEvent::SlotReleased {
                project_id,
                slot_number: slot,
                orphaned: false,
            },
        ),
        Err(e) => tracing::error!(job_id, slot, error = %e, "failed to release slot"),
    }

    let success = matches!(outcome, Outcome::Succeeded);
    let canceled = matches!(outcome, Outcome::Canceled(_));
    let pr_url = ctx.pr.as_ref().map(|p| p.url.clone());
    let mut logs = ctx.logs;
    if let Some(e) = &error {
        logs.push(e.clone());
    }
    PipelineResult {
        success,
        phase,
        error,
        pr_url,
        logs,
        visited,
        canceled,
        fallback_used,
    }
}
