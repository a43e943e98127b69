//! Incremental update feed.
//!
//! Every state change an Execution goes through is published as an
//! [`ExecutionUpdate`] on one broadcast channel shared by all Executions.
//! Live displays subscribe to it (optionally filtered to one Execution)
//! instead of polling snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::issues::Issue;
use crate::model::{ExecutionStatus, HealthState, LogEntry, Metrics};

/// Capacity of the shared update channel; slow subscribers lag past this.
pub const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Something that happened to an Execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StatusChanged {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    PhaseStarted {
        phase_id: String,
    },
    PhaseCompleted {
        phase_id: String,
        duration_ms: u64,
    },
    PhaseFailed {
        phase_id: String,
        error: String,
    },
    PhaseSkipped {
        phase_id: String,
        reason: String,
    },
    PhaseHalted {
        phase_id: String,
    },
    StepStarted {
        phase_id: String,
        step_id: String,
        attempt: u32,
    },
    StepRetrying {
        phase_id: String,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        phase_id: String,
        step_id: String,
        duration_ms: u64,
        output: String,
    },
    StepWarning {
        phase_id: String,
        step_id: String,
        error: String,
    },
    StepFailed {
        phase_id: String,
        step_id: String,
        error: String,
        output: String,
    },
    Progress {
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase_progress: Option<f64>,
    },
    Log {
        entry: LogEntry,
    },
    MetricsSampled {
        metrics: Metrics,
    },
    HealthChanged {
        from: HealthState,
        to: HealthState,
    },
    IssueRaised {
        issue: Issue,
    },
    IssueUpdated {
        issue: Issue,
    },
    RollbackStarted {
        plan_id: Uuid,
        steps: usize,
    },
    RollbackStepStarted {
        order: u32,
        step_id: String,
    },
    RollbackStepVerifying {
        order: u32,
        step_id: String,
    },
    RollbackStepCompleted {
        order: u32,
        step_id: String,
    },
    RollbackStepFailed {
        order: u32,
        error: String,
    },
}

impl ExecutionEvent {
    /// Short label for log lines and progress displays.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::PhaseSkipped { .. } => "phase_skipped",
            Self::PhaseHalted { .. } => "phase_halted",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepWarning { .. } => "step_warning",
            Self::StepFailed { .. } => "step_failed",
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::MetricsSampled { .. } => "metrics_sampled",
            Self::HealthChanged { .. } => "health_changed",
            Self::IssueRaised { .. } => "issue_raised",
            Self::IssueUpdated { .. } => "issue_updated",
            Self::RollbackStarted { .. } => "rollback_started",
            Self::RollbackStepStarted { .. } => "rollback_step_started",
            Self::RollbackStepVerifying { .. } => "rollback_step_verifying",
            Self::RollbackStepCompleted { .. } => "rollback_step_completed",
            Self::RollbackStepFailed { .. } => "rollback_step_failed",
        }
    }
}

/// One entry of the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: Uuid,
    /// Per-execution sequence number, gap-free from 0
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ExecutionEvent,
}

/// Publishes the updates of one Execution with consecutive sequence numbers.
#[derive(Debug)]
pub struct EventPublisher {
    execution_id: Uuid,
    seq: AtomicU64,
    tx: broadcast::Sender<ExecutionUpdate>,
}

impl EventPublisher {
    pub fn new(execution_id: Uuid, tx: broadcast::Sender<ExecutionUpdate>) -> Self {
        Self {
            execution_id,
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn publish(&self, event: ExecutionEvent) -> ExecutionUpdate {
        let update = ExecutionUpdate {
            execution_id: self.execution_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        };
        // No subscribers is fine.
        let _ = self.tx.send(update.clone());
        update
    }
}

/// A receiver on the feed, optionally restricted to one Execution.
pub struct Subscription {
    rx: broadcast::Receiver<ExecutionUpdate>,
    filter: Option<Uuid>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<ExecutionUpdate>, filter: Option<Uuid>) -> Self {
        Self { rx, filter }
    }

    /// Next matching update, or `None` once the feed is closed.
    /// Updates dropped because this subscriber lagged are skipped with a warning.
    pub async fn next(&mut self) -> Option<ExecutionUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => {
                    if self.filter.is_none_or(|id| id == update.execution_id) {
                        return Some(update);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "update subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_numbers_and_filtering() {
        let (tx, _) = broadcast::channel(16);
        let a = EventPublisher::new(Uuid::new_v4(), tx.clone());
        let b = EventPublisher::new(Uuid::new_v4(), tx.clone());
        let mut only_a = Subscription::new(tx.subscribe(), Some(a.execution_id));

        b.publish(ExecutionEvent::PhaseStarted {
            phase_id: "x".into(),
        });
        a.publish(ExecutionEvent::PhaseStarted {
            phase_id: "p1".into(),
        });
        a.publish(ExecutionEvent::PhaseHalted {
            phase_id: "p1".into(),
        });

        let first = only_a.next().await.unwrap();
        let second = only_a.next().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(second.event.kind(), "phase_halted");
    }

    #[tokio::test]
    async fn test_closed_feed_ends_subscription() {
        let (tx, _) = broadcast::channel::<ExecutionUpdate>(4);
        let mut sub = Subscription::new(tx.subscribe(), None);
        drop(tx);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_going() {
        let (tx, _) = broadcast::channel(2);
        let publisher = EventPublisher::new(Uuid::new_v4(), tx.clone());
        let mut sub = Subscription::new(tx.subscribe(), None);
        for i in 0..5 {
            publisher.publish(ExecutionEvent::PhaseStarted {
                phase_id: format!("p{i}"),
            });
        }
        let update = sub.next().await.unwrap();
        assert_eq!(update.seq, 3);
    }

    #[test]
    fn test_wire_shape() {
        let update = ExecutionUpdate {
            execution_id: Uuid::nil(),
            seq: 7,
            timestamp: Utc::now(),
            event: ExecutionEvent::StatusChanged {
                from: ExecutionStatus::Running,
                to: ExecutionStatus::Paused,
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["to"], "paused");
        assert_eq!(json["seq"], 7);

        let back: ExecutionUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(back, update);
    }
}
