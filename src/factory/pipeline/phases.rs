//! Phase functions.
//!
//! Each phase reads the current `PipelineContext` and returns a `Step`:
//! a new context to continue with, or a terminal outcome. A phase that
//! acquires a resource and then fails releases it before returning, so the
//! cleanup path only ever sees resources recorded in the context.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use super::context::{AiReport, Phase, PipelineContext, PrRef, SharedGuards, Workspace, commit_message};
use super::Outcome;
use crate::config::{CleanupTiming, ContextCarryover};
use crate::errors::{PipelineError, WorktreeError};
use crate::factory::agent::AgentRun;
use crate::factory::cancel::CancelSignal;
use crate::factory::events::{FactoryEvent, broadcast_message};
use crate::factory::git::{
    self, commit_all, commits_ahead, current_branch, git_streaming, is_dirty, local_branch_exists,
    remote_branch_exists, remote_exists, stash_pop, stash_push,
};
use crate::factory::models::{CardStatus, JobState, ProgressCheckpoint, WorktreeStatus};
use crate::factory::planner::{Planned, Planner, gather_repo_context};
use crate::factory::process::{CANCEL_POLL_INTERVAL, LineLogger, ProcessOutcome, ProcessSpec, run_streaming};
use crate::factory::prompt::{PromptInput, build_prompt};
use crate::factory::signals::{AgentSignals, extract_signals};
use crate::factory::sync_lock::DEFAULT_PRIORITY;
use crate::factory::tracker::{NewPullRequest, mirror_status};
use crate::util::tail_chars;

const FULL_CARRYOVER_CHARS: usize = 8_000;
const SUMMARY_FALLBACK_CHARS: usize = 1_500;

pub enum Step {
    Continue(PipelineContext),
    Canceled(String),
    Failed(PipelineError),
    Done(PipelineContext),
}

type PhaseResult = Result<Step, PipelineError>;

pub async fn run_phase(
    phase: Phase,
    ctx: &PipelineContext,
    cancel: &CancelSignal,
    logger: &LineLogger,
) -> Step {
    let result = match phase {
        Phase::Init => init(ctx).await,
        Phase::InProgress => in_progress(ctx).await,
        Phase::WorkingTree => working_tree(ctx, cancel).await,
        Phase::Fetch => fetch(ctx, cancel, logger).await,
        Phase::Branch => branch(ctx).await,
        Phase::Decomposition => decomposition(ctx, cancel, logger).await,
        Phase::Plan => plan(ctx, cancel, logger).await,
        Phase::Ai => ai(ctx, cancel, logger).await,
        Phase::Checks => checks(ctx, cancel, logger).await,
        Phase::Push => push(ctx, cancel, logger).await,
        Phase::Pr => pr(ctx).await,
        Phase::InReview => in_review(ctx).await,
        Phase::Done => Ok(Step::Done(ctx.clone().log("run complete"))),
    };
    result.unwrap_or_else(Step::Failed)
}

pub(super) fn emit(ctx: &PipelineContext, event: FactoryEvent) {
    broadcast_message(&ctx.env.events, &event);
}

fn lease_ttl(ctx: &PipelineContext) -> Duration {
    Duration::from_secs(ctx.config().workers.lease_ttl_secs)
}

fn git_timeout(ctx: &PipelineContext) -> Duration {
    ctx.config().git_timeout()
}

async fn mirror_card_status(ctx: &PipelineContext, status: CardStatus) {
    let (Some(tracker), Some(issue)) = (&ctx.env.tracker, ctx.card.remote_issue_number) else {
        return;
    };
    if let Err(e) = mirror_status(tracker.as_ref(), issue, status).await {
        tracing::warn!(card_id = ctx.card.id, issue, error = %e, "failed to mirror status label");
    }
}

// ── init / in_progress ───────────────────────────────────────────────

async fn init(ctx: &PipelineContext) -> PhaseResult {
    let job_id = ctx.job_id;
    let card_id = ctx.card.id;
    let ttl = lease_ttl(ctx);
    let started = ctx
        .env
        .db
        .call(move |db| db.transition_job(job_id, JobState::Running, None, None, ttl))
        .await;
    if let Err(e) = started {
        let state = ctx.env.db.call(move |db| db.get_job_state(job_id)).await?;
        return match state {
            Some(JobState::Canceled) => Ok(Step::Canceled(format!(
                "job {} was canceled before it started",
                job_id
            ))),
            None => Err(PipelineError::JobNotFound { job_id }),
            Some(_) => Err(e.into()),
        };
    }
    emit(
        ctx,
        FactoryEvent::JobStateChanged {
            job_id,
            card_id: Some(card_id),
            state: JobState::Running,
        },
    );

    let (resume, subtasks) = ctx
        .env
        .db
        .call(move |db| {
            Ok((
                db.latest_checkpoint_for_card(card_id, job_id)?,
                db.list_subtasks(card_id)?,
            ))
        })
        .await?;

    let mut next = ctx.clone();
    next.subtasks = subtasks;
    if let Some(cp) = &resume {
        let line = format!(
            "resuming from job {} checkpoint (phase {}, iteration {})",
            cp.job_id, cp.phase, cp.iteration
        );
        next.resume = resume;
        next = next.log(line);
    }
    Ok(Step::Continue(next.log(format!("job {} started", job_id))))
}

async fn in_progress(ctx: &PipelineContext) -> PhaseResult {
    let card_id = ctx.card.id;
    let moved = ctx
        .env
        .db
        .call(move |db| db.transition_card_status(card_id, CardStatus::Ready, CardStatus::InProgress))
        .await?;
    if !moved {
        return Ok(Step::Canceled(format!(
            "card {} left ready before it could be claimed",
            card_id
        )));
    }
    emit(
        ctx,
        FactoryEvent::CardStatusChanged {
            card_id,
            status: CardStatus::InProgress,
        },
    );
    mirror_card_status(ctx, CardStatus::InProgress).await;

    let mut next = ctx.clone();
    next.card.status = CardStatus::InProgress;
    Ok(Step::Continue(next.log("card moved to in_progress")))
}

// ── working_tree ─────────────────────────────────────────────────────

/// `None` when worktree isolation can be used, otherwise why not.
async fn worktree_unavailable(ctx: &PipelineContext) -> Result<Option<String>, PipelineError> {
    let config = ctx.config();
    if !config.worktrees.enabled {
        return Ok(Some("worktree isolation is disabled".to_string()));
    }
    match ctx.env.git_version().await {
        Some(v) if v.supports_worktrees() => {}
        Some(v) => {
            return Ok(Some(format!(
                "git {} is older than {}",
                v,
                git::MIN_WORKTREE_VERSION
            )));
        }
        None => return Ok(Some("git version could not be determined".to_string())),
    }
    let project_id = ctx.project.id;
    let active = ctx
        .env
        .db
        .call(move |db| db.count_active_worktrees(project_id))
        .await?;
    if active >= config.worktrees.max_concurrent {
        return Ok(Some(format!(
            "{} active worktrees reach the limit of {}",
            active, config.worktrees.max_concurrent
        )));
    }
    Ok(None)
}

async fn working_tree(ctx: &PipelineContext, cancel: &CancelSignal) -> PhaseResult {
    ctx.env.worktrees.ensure_excludes().await?;
    match worktree_unavailable(ctx).await? {
        None => setup_worktree(ctx).await,
        Some(reason) => setup_shared(ctx, cancel, reason).await,
    }
}

async fn setup_worktree(ctx: &PipelineContext) -> PhaseResult {
    let env = &ctx.env;
    let config = ctx.config();
    let path = env.worktrees.validate_path(&env.worktrees.path_for_card(ctx.card.id))?;
    let path_str = path.to_string_lossy().to_string();
    let holder = ctx.lock_holder();
    let lock_ttl = Duration::from_secs(config.worktrees.lock_ttl_secs);

    let (project_id, card_id) = (ctx.project.id, ctx.card.id);
    let (branch, base) = (ctx.branch.clone(), config.git.base_branch.clone());
    let (p, h) = (path_str.clone(), holder.clone());
    let record = env
        .db
        .call(move |db| {
            // Lock before rebinding so another holder's record is never touched.
            if let Some(existing) = db.get_worktree_by_path(&p)?
                && !db.acquire_worktree_lock(existing.id, &h, lock_ttl, Utc::now())?
            {
                return Ok(Err(existing.lock_holder.unwrap_or_default()));
            }
            let record =
                db.upsert_worktree(project_id, card_id, &p, &branch, &base, WorktreeStatus::Creating)?;
            if !db.acquire_worktree_lock(record.id, &h, lock_ttl, Utc::now())? {
                return Ok(Err(record.lock_holder.unwrap_or_default()));
            }
            Ok(Ok(record))
        })
        .await?;
    let record = match record {
        Ok(record) => record,
        Err(holder) => return Err(PipelineError::WorktreeLocked { path, holder }),
    };

    let ensured = match env
        .worktrees
        .ensure_worktree(&path, &ctx.branch, &config.git.base_branch, false)
        .await
    {
        Err(
            e @ (WorktreeError::PathOccupied { .. }
            | WorktreeError::Missing { .. }
            | WorktreeError::NotRegistered { .. }
            | WorktreeError::BranchMismatch { .. }),
        ) => {
            tracing::warn!(job_id = ctx.job_id, error = %e, "worktree unhealthy, recreating");
            match env.worktrees.prune().await {
                Ok(()) => {
                    env.worktrees
                        .ensure_worktree(&path, &ctx.branch, &config.git.base_branch, true)
                        .await
                }
                Err(e) => Err(e),
            }
        }
        other => other,
    };

    let record_id = record.id;
    let ensured = match ensured {
        Ok(ensured) => ensured,
        Err(e) => {
            let h = holder.clone();
            let released = env
                .db
                .call(move |db| {
                    db.update_worktree_status(record_id, WorktreeStatus::Error)?;
                    db.release_worktree_lock(record_id, &h)
                })
                .await;
            if let Err(release_err) = released {
                tracing::warn!(record_id, error = %release_err, "failed to release worktree after setup error");
            }
            return Err(e.into());
        }
    };

    let slot = ctx.slot_number;
    env.db
        .call(move |db| {
            db.update_worktree_status(record_id, WorktreeStatus::Running)?;
            db.assign_slot_worktree(project_id, slot, record_id)
        })
        .await?;

    let fresh = ensured.verb == crate::factory::worktree::CreationVerb::FromBase;
    let mut next = ctx.clone();
    next.workspace = Some(Workspace::Worktree {
        path: ensured.path.clone(),
        record_id,
        lock_holder: holder,
        fresh,
    });
    Ok(Step::Continue(next.log(format!(
        "worktree {} ready ({:?})",
        ensured.path.display(),
        ensured.verb
    ))))
}

async fn setup_shared(ctx: &PipelineContext, cancel: &CancelSignal, reason: String) -> PhaseResult {
    let env = &ctx.env;
    let checkout = tokio::select! {
        guard = env.shared_checkout.clone().lock_owned() => guard,
        reason = cancel.cancelled(CANCEL_POLL_INTERVAL) => {
            return Ok(Step::Canceled(format!("{} while waiting for the shared checkout", reason)));
        }
    };
    let worker = tokio::select! {
        guard = env.sync_lock.acquire_worker(DEFAULT_PRIORITY) => guard,
        reason = cancel.cancelled(CANCEL_POLL_INTERVAL) => {
            return Ok(Step::Canceled(format!("{} while waiting for the sync lock", reason)));
        }
    };

    let root = env.repo_root.clone();
    let t = git_timeout(ctx);
    let original_branch = current_branch(&root, t).await?;
    let message = ctx.stash_message();
    let stashed = stash_push(&root, &message, t).await?;

    let mut next = ctx.clone();
    next.workspace = Some(Workspace::Shared {
        path: root,
        original_branch,
        stash: stashed.then_some(message),
        guards: Arc::new(SharedGuards { checkout, worker }),
    });
    let next = next.log(format!("using shared checkout: {}", reason));
    Ok(Step::Continue(if stashed {
        next.log("stashed pre-existing changes")
    } else {
        next
    }))
}

// ── fetch / branch ───────────────────────────────────────────────────

async fn fetch(ctx: &PipelineContext, cancel: &CancelSignal, logger: &LineLogger) -> PhaseResult {
    let remote = ctx.config().git.remote.as_str();
    let cwd = ctx.cwd();
    let t = git_timeout(ctx);
    if !remote_exists(cwd, remote, t).await? {
        return Ok(Step::Continue(
            ctx.clone().log(format!("remote '{}' not configured, skipping fetch", remote)),
        ));
    }
    match git_streaming(cwd, &["fetch", remote, "--prune"], t, cancel, logger).await {
        Ok(ProcessOutcome::Canceled { reason }) => Ok(Step::Canceled(reason)),
        Ok(ProcessOutcome::Exited(_)) => Ok(Step::Continue(ctx.clone().log(format!("fetched {}", remote)))),
        Err(e) => {
            tracing::warn!(job_id = ctx.job_id, error = %e, "fetch failed");
            Ok(Step::Continue(
                ctx.clone().log(format!("fetch failed, continuing with local refs: {}", e)),
            ))
        }
    }
}

async fn branch(ctx: &PipelineContext) -> PhaseResult {
    let config = ctx.config();
    let remote = config.git.remote.as_str();
    let base_branch = &config.git.base_branch;
    let cwd = ctx.cwd();
    let t = git_timeout(ctx);

    let base_ref = if remote_branch_exists(cwd, remote, base_branch, t).await? {
        format!("{}/{}", remote, base_branch)
    } else {
        base_branch.clone()
    };

    let mut next = ctx.clone();
    match &ctx.workspace {
        Some(Workspace::Worktree { path, fresh, .. }) => {
            ctx.env.worktrees.verify_worktree(path, Some(&ctx.branch)).await?;
            if *fresh && base_ref != *base_branch {
                // Pick up what the fetch brought in; never rewrites local work.
                if let Err(e) = git::git(cwd, &["merge", "--ff-only", base_ref.as_str()], t).await {
                    next = next.log(format!("could not fast-forward to {}: {}", base_ref, e));
                }
            }
        }
        Some(Workspace::Shared { .. }) => {
            let current = current_branch(cwd, t).await?;
            if current != ctx.branch {
                if local_branch_exists(cwd, &ctx.branch, t).await? {
                    git::git(cwd, &["checkout", ctx.branch.as_str()], t).await?;
                } else if remote_branch_exists(cwd, remote, &ctx.branch, t).await? {
                    let upstream = format!("{}/{}", remote, ctx.branch);
                    git::git(cwd, &["checkout", "--track", "-b", ctx.branch.as_str(), upstream.as_str()], t).await?;
                } else {
                    git::git(cwd, &["checkout", "-b", ctx.branch.as_str(), base_ref.as_str()], t).await?;
                }
            }
        }
        None => {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "no workspace prepared before branch phase"
            )));
        }
    }

    next.repo_context = gather_repo_context(cwd, t).await;
    next.base_ref = base_ref;
    let line = format!("on branch {} (base {})", next.branch, next.base_ref);
    Ok(Step::Continue(next.log(line)))
}

// ── decomposition / plan ─────────────────────────────────────────────

async fn decomposition(ctx: &PipelineContext, cancel: &CancelSignal, logger: &LineLogger) -> PhaseResult {
    if !ctx.subtasks.is_empty() {
        let line = format!("reusing {} subtasks from a previous attempt", ctx.subtasks.len());
        return Ok(Step::Continue(ctx.clone().log(line)));
    }
    let selection = match ctx.env.select_tools() {
        Ok(selection) => selection,
        Err(e) => return Ok(Step::Continue(ctx.clone().log(format!("skipping decomposition: {}", e)))),
    };
    let config = ctx.config();
    let planner = Planner::new(selection.primary, config.agent_timeout());
    let drafts = match planner
        .decompose(
            &ctx.card,
            &ctx.repo_context,
            config.decomposition.max_subtasks,
            ctx.cwd(),
            cancel,
            logger,
        )
        .await
    {
        Planned::Canceled { reason } => return Ok(Step::Canceled(reason)),
        Planned::Ready(drafts) => drafts,
    };
    if drafts.is_empty() {
        return Ok(Step::Continue(ctx.clone().log("card was not decomposed")));
    }

    let card_id = ctx.card.id;
    let items: Vec<(String, String)> = drafts.into_iter().map(|d| (d.title, d.description)).collect();
    let mut subtasks = ctx
        .env
        .db
        .call(move |db| db.create_subtasks(card_id, &items))
        .await?;

    if config.decomposition.push_sub_issues
        && let Some(tracker) = &ctx.env.tracker
    {
        for subtask in &subtasks {
            let body = match ctx.card.remote_issue_number {
                Some(parent) => format!("{}\n\nPart of #{}", subtask.description, parent),
                None => subtask.description.clone(),
            };
            match tracker.create_issue(&subtask.title, &body, &[]).await {
                Ok(number) => {
                    let id = subtask.id;
                    ctx.env
                        .db
                        .call(move |db| db.set_subtask_remote_issue(id, number))
                        .await?;
                }
                Err(e) => {
                    tracing::warn!(card_id, error = %e, "failed to push sub-issue");
                    break;
                }
            }
        }
        subtasks = ctx.env.db.call(move |db| db.list_subtasks(card_id)).await?;
    }

    let mut next = ctx.clone();
    next.subtasks = subtasks;
    let line = format!("decomposed into {} subtasks", next.subtasks.len());
    Ok(Step::Continue(next.log(line)))
}

async fn plan(ctx: &PipelineContext, cancel: &CancelSignal, logger: &LineLogger) -> PhaseResult {
    let config = ctx.config();
    if !config.agent.planning {
        return Ok(Step::Continue(ctx.clone().log("planning disabled")));
    }
    let selection = match ctx.env.select_tools() {
        Ok(selection) => selection,
        Err(e) => return Ok(Step::Continue(ctx.clone().log(format!("skipping planning: {}", e)))),
    };
    let planner = Planner::new(selection.primary, config.agent_timeout());
    match planner
        .plan(&ctx.card, &ctx.repo_context, ctx.cwd(), cancel, logger)
        .await
    {
        Planned::Canceled { reason } => Ok(Step::Canceled(reason)),
        Planned::Ready(plan) => {
            let mut next = ctx.clone();
            next.plan = Some(plan.render());
            let line = format!("plan ready ({} steps)", plan.steps.len());
            Ok(Step::Continue(next.log(line)))
        }
    }
}

// ── ai ───────────────────────────────────────────────────────────────

/// First iteration to run and the context carried into it.
fn resume_point(ctx: &PipelineContext, max_iterations: u32) -> (u32, Option<String>) {
    let Some(cp) = &ctx.resume else {
        return (1, None);
    };
    let carry = Some(cp.context_summary.clone()).filter(|s| !s.trim().is_empty());
    if !ctx.config().iterative.enabled || cp.iteration <= 0 {
        return (1, carry);
    }
    let start = (cp.iteration as u32).saturating_add(1).min(max_iterations.max(1));
    (start, carry)
}

fn carry_forward(mode: ContextCarryover, signals: &AgentSignals, output: &str) -> Option<String> {
    match mode {
        ContextCarryover::Full => Some(tail_chars(output, FULL_CARRYOVER_CHARS)),
        ContextCarryover::Summary => Some(
            signals
                .summary
                .clone()
                .unwrap_or_else(|| tail_chars(output, SUMMARY_FALLBACK_CHARS)),
        ),
        ContextCarryover::None => None,
    }
}

async fn ai(ctx: &PipelineContext, cancel: &CancelSignal, logger: &LineLogger) -> PhaseResult {
    let selection = ctx.env.select_tools()?;
    let config = ctx.config();
    let timeout = config.agent_timeout();
    let deadline = Instant::now() + timeout;
    let iterative = config.iterative.enabled;
    let max_iterations = if iterative { config.iterative.max_iterations } else { 1 };
    let (mut iteration, mut carry) = resume_point(ctx, max_iterations);
    let cwd = ctx.cwd();
    let card_id = ctx.card.id;

    let mut next = ctx.clone();
    let mut active = selection.primary.clone();
    let mut fallback = selection.fallback.clone();
    let mut report = AiReport {
        tool: active.name().to_string(),
        ..Default::default()
    };

    while iteration <= max_iterations {
        if let Some(reason) = cancel.check().await {
            return Ok(Step::Canceled(reason));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PipelineError::Timeout {
                phase: Phase::Ai.to_string(),
                timeout,
            });
        }

        let prompt = build_prompt(&PromptInput {
            card: Some(&next.card),
            plan: next.plan.clone(),
            allowed_commands: &config.agent.allowed_commands,
            allowed_paths: &config.agent.allowed_paths,
            repo_context: &next.repo_context,
            subtasks: &next.subtasks,
            iteration: iterative.then_some((iteration, max_iterations)),
            carryover: carry.as_deref(),
        });

        let response = loop {
            match active.execute(&prompt, cwd, remaining, cancel, logger).await {
                AgentRun::Canceled { reason } => return Ok(Step::Canceled(reason)),
                AgentRun::Completed(resp) if resp.success => break resp,
                AgentRun::Completed(resp) => {
                    if resp.timed_out {
                        return Err(PipelineError::Timeout {
                            phase: Phase::Ai.to_string(),
                            timeout,
                        });
                    }
                    let error = resp
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("{} failed", active.name()));
                    let limited = active.is_retryable_limit_error(&error);
                    match fallback.take() {
                        Some(alternate) if limited => {
                            tracing::warn!(
                                job_id = ctx.job_id,
                                from = active.name(),
                                to = alternate.name(),
                                "rate limited, switching provider"
                            );
                            next = next.log(format!(
                                "{} hit a usage limit, falling back to {}",
                                active.name(),
                                alternate.name()
                            ));
                            active = alternate;
                            // Totals keep earlier iterations; the failed call adds nothing.
                            report.fallback_used = true;
                            report.tool = active.name().to_string();
                        }
                        _ => return Err(PipelineError::Agent(error)),
                    }
                }
            }
        };

        report.usage.add(&response.usage);
        report.iterations += 1;
        let signals = extract_signals(&response.output);
        for blocker in &signals.blockers {
            next = next.log(format!("agent reported blocker: {}", blocker));
        }
        if !signals.completed_subtasks.is_empty() {
            let positions = signals.completed_subtasks.clone();
            next.subtasks = ctx
                .env
                .db
                .call(move |db| {
                    for position in positions {
                        db.complete_subtask(card_id, position)?;
                    }
                    db.list_subtasks(card_id)
                })
                .await?;
        }
        carry = carry_forward(config.iterative.context_carryover, &signals, &response.output);
        next.iteration = iteration;
        next.carryover = carry.clone();
        emit(
            ctx,
            FactoryEvent::AgentProgress {
                job_id: ctx.job_id,
                iteration,
                percent: signals.progress,
                completed_subtasks: next.completed_subtasks(),
            },
        );

        if iterative {
            let message = format!("wip: iteration {} (card #{})", iteration, card_id);
            commit_all(cwd, &message, git_timeout(ctx)).await?;
            let checkpoint = ProgressCheckpoint {
                job_id: ctx.job_id,
                card_id,
                phase: Phase::Ai.to_string(),
                iteration: iteration as i64,
                completed_subtasks: next.completed_subtasks() as i64,
                context_summary: carry.clone().unwrap_or_default(),
                updated_at: Utc::now(),
            };
            ctx.env.db.call(move |db| db.save_checkpoint(&checkpoint)).await?;
            next = next.log(format!("iteration {}/{} complete", iteration, max_iterations));
        }

        if !next.subtasks.is_empty() && next.completed_subtasks() == next.subtasks.len() {
            next = next.log("all subtasks reported complete");
            break;
        }
        iteration += 1;
    }

    let line = format!(
        "ai finished with {} ({} tokens{})",
        report.tool,
        report.usage.total_tokens(),
        if report.fallback_used { ", fallback" } else { "" }
    );
    next.ai = Some(report);
    Ok(Step::Continue(next.log(line)))
}

// ── checks ───────────────────────────────────────────────────────────

async fn checks(ctx: &PipelineContext, cancel: &CancelSignal, logger: &LineLogger) -> PhaseResult {
    let config = ctx.config();
    let commands = config.checks.commands();
    if commands.is_empty() {
        return Ok(Step::Continue(ctx.clone().log("no checks configured")));
    }
    let mut next = ctx.clone();
    next.failed_checks.clear();
    for (name, command) in commands {
        let spec = ProcessSpec::shell(command, ctx.cwd(), config.checks_timeout());
        match run_streaming(&spec, cancel, logger).await {
            Ok(ProcessOutcome::Canceled { reason }) => return Ok(Step::Canceled(reason)),
            Ok(ProcessOutcome::Exited(_)) => next = next.log(format!("check '{}' passed", name)),
            Err(e) => {
                tracing::warn!(job_id = ctx.job_id, check = name, error = %e, "check failed");
                next.failed_checks.push(name.to_string());
                let first = e.to_string().lines().next().unwrap_or_default().to_string();
                next = next.log(format!("check '{}' failed: {}", name, first));
            }
        }
    }
    Ok(Step::Continue(next))
}

// ── push / pr / in_review ────────────────────────────────────────────

async fn push(ctx: &PipelineContext, cancel: &CancelSignal, logger: &LineLogger) -> PhaseResult {
    let config = ctx.config();
    let remote = config.git.remote.as_str();
    let cwd = ctx.cwd();
    let t = git_timeout(ctx);

    let mut next = ctx.clone();
    if commit_all(cwd, &commit_message(&config.git.commit_template, &ctx.card), t).await? {
        next = next.log("committed changes");
    }
    if commits_ahead(cwd, &ctx.base_ref, t).await? == 0 {
        return Err(PipelineError::NoChanges {
            branch: ctx.branch.clone(),
            base: ctx.base_ref.clone(),
        });
    }
    if !remote_exists(cwd, remote, t).await? {
        return Err(PipelineError::Other(anyhow::anyhow!(
            "remote '{}' is not configured; cannot push {}",
            remote,
            ctx.branch
        )));
    }

    if remote_branch_exists(cwd, remote, &ctx.branch, t).await? {
        let upstream = format!("{}/{}", remote, ctx.branch);
        match git_streaming(cwd, &["rebase", upstream.as_str()], t, cancel, logger).await {
            Ok(ProcessOutcome::Exited(_)) => next = next.log(format!("rebased onto {}", upstream)),
            Ok(ProcessOutcome::Canceled { reason }) => {
                let _ = git::git(cwd, &["rebase", "--abort"], t).await;
                return Ok(Step::Canceled(reason));
            }
            Err(e) => {
                let _ = git::git(cwd, &["rebase", "--abort"], t).await;
                return Err(e.into());
            }
        }
    }

    match git_streaming(cwd, &["push", "-u", remote, ctx.branch.as_str()], t, cancel, logger).await? {
        ProcessOutcome::Canceled { reason } => Ok(Step::Canceled(reason)),
        ProcessOutcome::Exited(_) => {
            let line = format!("pushed {} to {}", ctx.branch, remote);
            Ok(Step::Continue(next.log(line)))
        }
    }
}

fn pr_body(ctx: &PipelineContext) -> String {
    let mut body = format!("## Summary\n\nAutomated implementation for: **{}**\n\n", ctx.card.title);
    if !ctx.card.description.trim().is_empty() {
        body.push_str(ctx.card.description.trim());
        body.push_str("\n\n");
    }
    if let Some(plan) = &ctx.plan {
        body.push_str("## Plan\n\n");
        body.push_str(plan.trim());
        body.push_str("\n\n");
    }
    if !ctx.failed_checks.is_empty() {
        body.push_str(&format!(
            "## Needs review\n\nFailing checks: {}\n\n",
            ctx.failed_checks.join(", ")
        ));
    }
    if let Some(ai) = &ctx.ai {
        body.push_str(&format!(
            "Implemented with {} ({} tokens, ${:.2}){}.\n\n",
            ai.tool,
            ai.usage.total_tokens(),
            ai.usage.cost_usd,
            if ai.fallback_used { " after a provider fallback" } else { "" }
        ));
    }
    if let Some(issue) = ctx.card.remote_issue_number {
        body.push_str(&format!("Closes #{}\n\n", issue));
    }
    body.push_str("---\n*Created by Foundry*");
    body
}

async fn pr(ctx: &PipelineContext) -> PhaseResult {
    let Some(tracker) = ctx.env.tracker.clone() else {
        tracing::warn!(job_id = ctx.job_id, "no tracker configured; skipping pull request");
        return Ok(Step::Continue(
            ctx.clone().log("no tracker configured, skipping pull request"),
        ));
    };

    let existing = match tracker.list_pull_requests(&ctx.branch).await {
        Ok(prs) => prs.into_iter().next(),
        Err(e) => {
            tracing::warn!(job_id = ctx.job_id, error = %e, "could not list pull requests");
            None
        }
    };
    let (pull, reused) = match existing {
        Some(pull) => (pull, true),
        None => {
            let draft = !ctx.checks_passed();
            let title = if draft {
                format!("[WIP] {}", ctx.card.title)
            } else {
                ctx.card.title.clone()
            };
            let request = NewPullRequest {
                title,
                body: pr_body(ctx),
                head: ctx.branch.clone(),
                base: ctx.config().git.base_branch.clone(),
                draft,
            };
            (tracker.create_pull_request(&request).await?, false)
        }
    };

    emit(
        ctx,
        FactoryEvent::PrCreated {
            job_id: ctx.job_id,
            card_id: ctx.card.id,
            url: pull.url.clone(),
            draft: pull.draft,
        },
    );
    let mut next = ctx.clone();
    next.pr = Some(PrRef {
        url: pull.url.clone(),
        draft: pull.draft,
    });
    let verb = if reused { "reusing" } else { "opened" };
    Ok(Step::Continue(next.log(format!("{} pull request {}", verb, pull.url))))
}

async fn in_review(ctx: &PipelineContext) -> PhaseResult {
    let card_id = ctx.card.id;
    let moved = ctx
        .env
        .db
        .call(move |db| db.transition_card_status(card_id, CardStatus::InProgress, CardStatus::InReview))
        .await?;
    if !moved {
        return Ok(Step::Canceled(format!(
            "card {} left in_progress before review",
            card_id
        )));
    }
    emit(
        ctx,
        FactoryEvent::CardStatusChanged {
            card_id,
            status: CardStatus::InReview,
        },
    );
    mirror_card_status(ctx, CardStatus::InReview).await;
    if let (Some(tracker), Some(issue), Some(pr)) =
        (&ctx.env.tracker, ctx.card.remote_issue_number, &ctx.pr)
        && let Err(e) = tracker
            .comment_on_issue(issue, &format!("Pull request ready for review: {}", pr.url))
            .await
    {
        tracing::warn!(card_id, issue, error = %e, "failed to comment on issue");
    }

    let mut next = ctx.clone();
    next.card.status = CardStatus::InReview;
    Ok(Step::Continue(next.log("card moved to in_review")))
}

// ── cleanup ──────────────────────────────────────────────────────────

/// Release and tidy the workspace. Always runs; every step is best-effort
/// and reported in the run's logs.
pub async fn cleanup(ctx: PipelineContext, outcome: &Outcome) -> PipelineContext {
    let Some(workspace) = ctx.workspace.clone() else {
        return ctx;
    };
    let mut next = match workspace {
        Workspace::Worktree {
            path,
            record_id,
            lock_holder,
            ..
        } => cleanup_worktree(ctx, &path, record_id, &lock_holder, outcome).await,
        Workspace::Shared {
            path,
            original_branch,
            stash,
            ..
        } => cleanup_shared(ctx, &path, &original_branch, stash.as_deref(), outcome).await,
    };
    next.workspace = None;
    next
}

async fn cleanup_worktree(
    ctx: PipelineContext,
    path: &std::path::Path,
    record_id: i64,
    holder: &str,
    outcome: &Outcome,
) -> PipelineContext {
    let config = ctx.config();
    let timing = match outcome {
        Outcome::Succeeded => config.worktrees.cleanup_on_success,
        Outcome::Failed(_) | Outcome::Canceled(_) => config.worktrees.cleanup_on_failure,
    };
    let delay = config.cleanup_delay();
    let db = ctx.env.db.clone();
    let mut next = ctx.clone();

    let status_update = match timing {
        CleanupTiming::Immediate => match ctx.env.worktrees.remove_worktree(path, true).await {
            Ok(()) => {
                next = next.log(format!("removed worktree {}", path.display()));
                db.call(move |db| db.update_worktree_status(record_id, WorktreeStatus::Cleaned))
                    .await
            }
            Err(e) => {
                next = next.log(format!("worktree removal failed, deferring: {}", e));
                db.call(move |db| db.schedule_worktree_cleanup(record_id, Duration::ZERO, Utc::now()))
                    .await
            }
        },
        CleanupTiming::Delay => {
            next = next.log(format!(
                "worktree {} kept for {} minutes",
                path.display(),
                config.worktrees.cleanup_delay_minutes
            ));
            db.call(move |db| db.schedule_worktree_cleanup(record_id, delay, Utc::now()))
                .await
        }
        CleanupTiming::Never => {
            db.call(move |db| db.update_worktree_status(record_id, WorktreeStatus::Ready))
                .await
        }
    };
    if let Err(e) = status_update {
        tracing::warn!(record_id, error = %e, "failed to record worktree cleanup");
    }

    let h = holder.to_string();
    match db.call(move |db| db.release_worktree_lock(record_id, &h)).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(record_id, holder, "worktree lock was no longer held"),
        Err(e) => tracing::warn!(record_id, error = %e, "failed to release worktree lock"),
    }
    next
}

async fn cleanup_shared(
    ctx: PipelineContext,
    root: &std::path::Path,
    original_branch: &str,
    stash: Option<&str>,
    outcome: &Outcome,
) -> PipelineContext {
    let t = git_timeout(&ctx);
    let rollback = matches!(outcome, Outcome::Canceled(_)) && ctx.config().worktrees.rollback_on_cancel;
    let mut next = ctx.clone();

    if rollback {
        let reset = git::git(root, &["reset", "--hard", "HEAD"], t).await;
        let clean = git::git(root, &["clean", "-fd"], t).await;
        next = match reset.and(clean) {
            Ok(_) => next.log("rolled back working tree"),
            Err(e) => next.log(format!("rollback failed: {}", e)),
        };
    } else if matches!(current_branch(root, t).await, Ok(b) if b == ctx.branch)
        && is_dirty(root, t).await.unwrap_or(false)
    {
        let message = format!("wip: unfinished changes from job {}", ctx.job_id);
        if let Err(e) = commit_all(root, &message, t).await {
            next = next.log(format!("could not save leftover changes: {}", e));
        } else {
            next = next.log(format!("saved leftover changes on {}", ctx.branch));
        }
    }

    match current_branch(root, t).await {
        Ok(current) if current != original_branch => {
            if let Err(e) = git::git(root, &["checkout", original_branch], t).await {
                next = next.log(format!("could not return to {}: {}", original_branch, e));
            }
        }
        Ok(_) => {}
        Err(e) => next = next.log(format!("could not read current branch: {}", e)),
    }

    if let Some(message) = stash {
        next = match stash_pop(root, message, t).await {
            Ok(true) => next.log("restored stashed changes"),
            Ok(false) => next.log("stash entry not found; nothing restored"),
            Err(e) => next.log(format!("failed to restore stash '{}': {}", message, e)),
        };
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carryover_modes() {
        let signals = extract_signals("did things <summary>schema added</summary>");
        assert_eq!(
            carry_forward(ContextCarryover::Summary, &signals, "ignored").as_deref(),
            Some("schema added")
        );
        let none = extract_signals("no summary");
        assert_eq!(
            carry_forward(ContextCarryover::Summary, &none, "raw output").as_deref(),
            Some("raw output")
        );
        assert_eq!(
            carry_forward(ContextCarryover::Full, &none, "everything").as_deref(),
            Some("everything")
        );
        assert!(carry_forward(ContextCarryover::None, &signals, "x").is_none());
    }
}
