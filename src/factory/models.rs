use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub remote_repo: Option<String>,
    pub created_at: String,
}

/// Lifecycle status of a card. The status is the authoritative external
/// cancellation signal for a running pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Draft,
    Ready,
    InProgress,
    InReview,
    Testing,
    Done,
}

impl CardStatus {
    pub const ALL: [CardStatus; 6] = [
        Self::Draft,
        Self::Ready,
        Self::InProgress,
        Self::InReview,
        Self::Testing,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Testing => "testing",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "testing" => Ok(Self::Testing),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid card status: {}", s)),
        }
    }
}

/// A trackable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub status: CardStatus,
    pub labels: Vec<String>,
    pub remote_issue_number: Option<i64>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    AgentRun,
    SyncPoll,
    SyncPush,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentRun => "agent_run",
            Self::SyncPoll => "sync_poll",
            Self::SyncPush => "sync_push",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_run" => Ok(Self::AgentRun),
            "sync_poll" => Ok(Self::SyncPoll),
            "sync_push" => Ok(Self::SyncPush),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

/// Persisted job state. Any actor may set `Canceled`; the pipeline discovers
/// it by polling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Whether a job may move from `from` to `to`. Terminal states are final.
pub fn is_valid_transition(from: &JobState, to: &JobState) -> bool {
    matches!(
        (from, to),
        (JobState::Queued, JobState::Running)
            | (JobState::Queued, JobState::Canceled)
            | (JobState::Queued, JobState::Failed)
            | (JobState::Running, JobState::Succeeded)
            | (JobState::Running, JobState::Failed)
            | (JobState::Running, JobState::Canceled)
    )
}

/// One execution attempt against a card (or a sync pass when `card_id` is None).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub project_id: i64,
    pub card_id: Option<i64>,
    pub job_type: JobType,
    pub state: JobState,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Running,
    Ready,
    Error,
    CleanupPending,
    Cleaned,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::CleanupPending => "cleanup_pending",
            Self::Cleaned => "cleaned",
        }
    }

    /// Statuses that count against the per-project concurrent worktree limit.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Creating | Self::Running)
    }
}

impl FromStr for WorktreeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            "cleanup_pending" => Ok(Self::CleanupPending),
            "cleaned" => Ok(Self::Cleaned),
            _ => Err(format!("Invalid worktree status: {}", s)),
        }
    }
}

/// Persisted record of an isolated checkout bound to one card's branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub id: i64,
    pub project_id: i64,
    pub card_id: i64,
    pub path: String,
    pub branch: String,
    pub base_ref: String,
    pub status: WorktreeStatus,
    pub lock_holder: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Idle,
    Running,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
        }
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            _ => Err(format!("Invalid slot status: {}", s)),
        }
    }
}

/// A bounded concurrency unit of a project's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub project_id: i64,
    pub slot_number: i64,
    pub status: SlotStatus,
    pub card_id: Option<i64>,
    pub job_id: Option<i64>,
    pub worktree_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Outcome of an atomic slot claim.
#[derive(Debug, Clone)]
pub enum SlotClaim {
    Acquired(Slot),
    /// An idle slot was seen but another acquirer won the race.
    Contended,
    /// No idle slot left.
    Exhausted,
}

/// Periodic progress record so a resumed run can skip completed work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressCheckpoint {
    pub job_id: i64,
    pub card_id: i64,
    pub phase: String,
    pub iteration: i64,
    pub completed_subtasks: i64,
    pub context_summary: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Completed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid subtask status: {}", s)),
        }
    }
}

/// A piece of a decomposed card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    pub card_id: i64,
    pub position: i64,
    pub title: String,
    pub description: String,
    pub status: SubtaskStatus,
    pub remote_issue_number: Option<i64>,
}

/// Read-only summary of a project's pool, used by `foundry status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub project_id: i64,
    pub slots: Vec<Slot>,
    pub queued_cards: usize,
}
