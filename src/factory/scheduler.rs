//! Periodic remote sync.
//!
//! Every `sync.interval_secs` the scheduler pulls the tracker's issues and,
//! holding the project's exclusive sync lock, reconciles local cards: cards
//! whose issue was closed move to `done` (a running pipeline stops at its
//! next gate), new open issues become `draft` cards, and local statuses are
//! pushed back as labels. Each pass is recorded as a `sync_poll` and a
//! `sync_push` job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FoundryToml;
use crate::factory::db::DbHandle;
use crate::factory::events::{FactoryEvent, broadcast_message};
use crate::factory::models::{CardStatus, JobState, JobType, Project};
use crate::factory::sync_lock::SyncLock;
use crate::factory::tracker::{IssueState, RemoteIssue, RemoteTracker, mirror_status};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub closed: usize,
    pub imported: usize,
    pub pushed: usize,
}

pub struct SyncScheduler {
    project: Project,
    db: DbHandle,
    config: Arc<FoundryToml>,
    tracker: Arc<dyn RemoteTracker>,
    lock: Arc<SyncLock>,
    events: broadcast::Sender<String>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        project: Project,
        db: DbHandle,
        config: Arc<FoundryToml>,
        tracker: Arc<dyn RemoteTracker>,
        lock: Arc<SyncLock>,
        events: broadcast::Sender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            project,
            db,
            config,
            tracker,
            lock,
            events,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!(
            project_id = self.project.id,
            interval_secs = self.config.sync.interval_secs,
            provider = self.tracker.provider(),
            "sync scheduler started"
        );
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(project_id = self.project.id, error = %e, "sync task ended abnormally");
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.sync.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync_once().await {
                tracing::warn!(project_id = self.project.id, error = %e, "sync pass failed");
            }
        }
    }

    /// One full pass: pull, reconcile, push.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let project_id = self.project.id;
        if !self.tracker.check_auth().await? {
            tracing::warn!(project_id, provider = self.tracker.provider(), "tracker not authenticated, skipping sync");
            return Ok(SyncReport::default());
        }

        let poll_job = self.begin_job(JobType::SyncPoll).await?;
        let issues = match self.tracker.list_issues().await {
            Ok(issues) => issues,
            Err(e) => {
                self.finish_job(poll_job, Err(format!("{:#}", e))).await;
                return Err(e);
            }
        };

        let outcome = self
            .lock
            .with_sync_lock(|| async {
                let (closed, imported) = self.reconcile(&issues).await?;
                let push_job = self.begin_job(JobType::SyncPush).await?;
                let pushed = self.push_labels(&issues).await;
                self.finish_job(push_job, Ok(serde_json::json!({ "pushed": pushed }))).await;
                Ok::<_, anyhow::Error>(SyncReport {
                    closed,
                    imported,
                    pushed,
                })
            })
            .await;

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                self.finish_job(poll_job, Err(format!("{:#}", e))).await;
                return Err(e);
            }
        };
        self.finish_job(
            poll_job,
            Ok(serde_json::json!({ "closed": report.closed, "imported": report.imported })),
        )
        .await;

        tracing::info!(project_id, closed = report.closed, imported = report.imported, pushed = report.pushed, "sync complete");
        broadcast_message(
            &self.events,
            &FactoryEvent::SyncCompleted {
                project_id,
                closed: report.closed,
                imported: report.imported,
                pushed: report.pushed,
            },
        );
        Ok(report)
    }

    /// Close cards whose issue was closed and import new open issues.
    /// Must run under the sync lock.
    async fn reconcile(&self, issues: &[RemoteIssue]) -> Result<(usize, usize)> {
        let project_id = self.project.id;
        let import = self.config.sync.import_issues;
        let issues = issues.to_vec();
        let (closed, imported) = self
            .db
            .call(move |db| {
                let mut closed = Vec::new();
                let mut imported = 0;
                for issue in &issues {
                    let existing = db.find_card_by_remote_issue(project_id, issue.number)?;
                    match (issue.state, existing) {
                        (IssueState::Closed, Some(card)) if card.status != CardStatus::Done => {
                            db.update_card_status(card.id, CardStatus::Done)?;
                            closed.push(card.id);
                        }
                        (IssueState::Open, None) if import => {
                            let card = db.create_card(project_id, &issue.title, &issue.body, CardStatus::Draft)?;
                            db.set_card_remote_issue(card.id, issue.number)?;
                            db.set_card_labels(card.id, &issue.labels)?;
                            imported += 1;
                        }
                        _ => {}
                    }
                }
                Ok((closed, imported))
            })
            .await?;

        for card_id in &closed {
            tracing::info!(project_id, card_id, "remote issue closed, card moved to done");
            broadcast_message(
                &self.events,
                &FactoryEvent::CardStatusChanged {
                    card_id: *card_id,
                    status: CardStatus::Done,
                },
            );
        }
        Ok((closed.len(), imported))
    }

    /// Mirror local statuses onto issues missing their label. Failures are
    /// logged per issue.
    async fn push_labels(&self, issues: &[RemoteIssue]) -> usize {
        let project_id = self.project.id;
        let cards = match self.db.call(move |db| db.list_cards(project_id)).await {
            Ok(cards) => cards,
            Err(e) => {
                tracing::warn!(project_id, error = %e, "could not list cards for label push");
                return 0;
            }
        };
        let remote: HashMap<i64, &RemoteIssue> = issues.iter().map(|i| (i.number, i)).collect();

        let mut pushed = 0;
        for card in cards {
            let Some(number) = card.remote_issue_number else {
                continue;
            };
            let Some(issue) = remote.get(&number) else {
                continue;
            };
            if issue.state == IssueState::Closed {
                continue;
            }
            let wanted = self.tracker.status_label(card.status);
            let stale = issue
                .labels
                .iter()
                .any(|l| l.starts_with(self.tracker.label_prefix()) && *l != wanted);
            if issue.labels.contains(&wanted) && !stale {
                continue;
            }
            match mirror_status(self.tracker.as_ref(), number, card.status).await {
                Ok(()) => pushed += 1,
                Err(e) => tracing::warn!(project_id, card_id = card.id, issue = number, error = %e, "label push failed"),
            }
        }
        pushed
    }

    async fn begin_job(&self, job_type: JobType) -> Result<i64> {
        let project_id = self.project.id;
        let ttl = Duration::from_secs(self.config.workers.lease_ttl_secs);
        self.db
            .call(move |db| {
                let job = db.create_job(project_id, None, job_type)?;
                db.transition_job(job.id, JobState::Running, None, None, ttl)?;
                Ok(job.id)
            })
            .await
    }

    async fn finish_job(&self, job_id: i64, outcome: std::result::Result<serde_json::Value, String>) {
        let ttl = Duration::from_secs(self.config.workers.lease_ttl_secs);
        let stored = self
            .db
            .call(move |db| match &outcome {
                Ok(result) => db.transition_job(job_id, JobState::Succeeded, None, Some(result), ttl),
                Err(message) => db.transition_job(job_id, JobState::Failed, Some(message), None, ttl),
            })
            .await;
        if let Err(e) = stored {
            tracing::warn!(job_id, error = %e, "failed to record sync job outcome");
        }
    }
}
