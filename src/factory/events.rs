use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{CardStatus, JobState, PoolSnapshot};

/// Capacity of the notification channel; slow receivers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status notifications pushed to observers (UI, CLI status stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FactoryEvent {
    PoolStarted {
        project_id: i64,
        max_workers: usize,
    },
    PoolStopped {
        project_id: i64,
    },
    PoolStatusChanged {
        snapshot: PoolSnapshot,
    },
    SlotReleased {
        project_id: i64,
        slot_number: i64,
        orphaned: bool,
    },
    CardStatusChanged {
        card_id: i64,
        status: CardStatus,
    },
    JobStateChanged {
        job_id: i64,
        card_id: Option<i64>,
        state: JobState,
    },
    PhaseStarted {
        job_id: i64,
        card_id: i64,
        phase: String,
    },
    AgentProgress {
        job_id: i64,
        iteration: u32,
        percent: Option<u8>,
        completed_subtasks: usize,
    },
    PrCreated {
        job_id: i64,
        card_id: i64,
        url: String,
        draft: bool,
    },
    SyncCompleted {
        project_id: i64,
        closed: usize,
        imported: usize,
        pushed: usize,
    },
}

pub fn channel() -> broadcast::Sender<String> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Serialize and send. Having no receivers is not an error.
pub fn broadcast_message(tx: &broadcast::Sender<String>, event: &FactoryEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize FactoryEvent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(FactoryEvent::PhaseStarted {
            job_id: 3,
            card_id: 7,
            phase: "checks".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "PhaseStarted");
        assert_eq!(json["data"]["phase"], "checks");
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers_and_tolerates_none() {
        let tx = channel();
        broadcast_message(&tx, &FactoryEvent::PoolStopped { project_id: 1 });

        let mut rx = tx.subscribe();
        broadcast_message(
            &tx,
            &FactoryEvent::CardStatusChanged {
                card_id: 2,
                status: CardStatus::InReview,
            },
        );
        let msg = rx.recv().await.unwrap();
        let parsed: FactoryEvent = serde_json::from_str(&msg).unwrap();
        assert!(matches!(
            parsed,
            FactoryEvent::CardStatusChanged {
                card_id: 2,
                status: CardStatus::InReview
            }
        ));
    }
}
