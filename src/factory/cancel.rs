//! Layered cancellation.
//!
//! A `CancelSignal` combines an in-process `CancellationToken` (immediate)
//! with an optional persisted-state probe (cross-process, eventually
//! consistent). The persisted job state remains the source of truth; the
//! token only makes same-process cancellation visible without waiting for a
//! poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::db::DbHandle;
use super::models::JobState;

/// A cross-process cancellation source.
#[async_trait]
pub trait CancelProbe: Send + Sync {
    /// `Some(reason)` once the work should stop.
    async fn should_cancel(&self) -> Option<String>;
}

/// Reads the job's persisted state. Transient read errors never cancel.
pub struct JobStateProbe {
    db: DbHandle,
    job_id: i64,
}

impl JobStateProbe {
    pub fn new(db: DbHandle, job_id: i64) -> Self {
        Self { db, job_id }
    }
}

#[async_trait]
impl CancelProbe for JobStateProbe {
    async fn should_cancel(&self) -> Option<String> {
        let job_id = self.job_id;
        match self.db.call(move |db| db.get_job_state(job_id)).await {
            Ok(Some(JobState::Canceled)) => Some(format!("job {} was canceled", job_id)),
            Ok(None) => Some(format!("job {} no longer exists", job_id)),
            Ok(Some(_)) => None,
            Err(e) => {
                tracing::debug!(job_id, error = %e, "cancel probe read failed");
                None
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    probe: Option<Arc<dyn CancelProbe>>,
}

impl CancelSignal {
    pub fn new(token: CancellationToken, probe: Option<Arc<dyn CancelProbe>>) -> Self {
        Self { token, probe }
    }

    /// A signal that only fires when `token` is canceled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, probe: None }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Checks the token first, then the persisted probe.
    pub async fn check(&self) -> Option<String> {
        if self.token.is_cancelled() {
            return Some("canceled in-process".to_string());
        }
        match &self.probe {
            Some(probe) => probe.should_cancel().await,
            None => None,
        }
    }

    /// Resolves with the reason once either source fires. The token wakes
    /// it at once; the probe is read every `every`.
    pub async fn cancelled(&self, every: Duration) -> String {
        loop {
            if let Some(reason) = self.check().await {
                return reason;
            }
            tokio::select! {
                _ = self.token.cancelled() => {}
                _ = tokio::time::sleep(every) => {}
            }
        }
    }
}
