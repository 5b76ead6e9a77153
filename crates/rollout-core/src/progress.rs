//! Progress events and the sinks that receive them.
//!
//! Every status change the orchestrator applies is reported as a
//! [`ProgressEvent`]. Delivery is at-least-once: a resumed drive may report a
//! transition again, so consumers must tolerate duplicates.

use crate::execution::{ApprovalRecord, ReleaseExecution, StageExecution};
use crate::types::{ExecutionStatus, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ExecutionCreated {
        execution_id: Uuid,
        release_id: u64,
        release_number: String,
        at: DateTime<Utc>,
    },
    ExecutionTransition {
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        at: DateTime<Utc>,
    },
    StageTransition {
        execution_id: Uuid,
        stage_execution_id: Uuid,
        label: String,
        from: StageStatus,
        to: StageStatus,
        at: DateTime<Utc>,
    },
    ApprovalRecorded {
        execution_id: Uuid,
        stage_execution_id: Uuid,
        record: ApprovalRecord,
    },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Writes one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::ExecutionCreated {
                execution_id,
                release_id,
                release_number,
                ..
            } => info!(%execution_id, release_id, %release_number, "release execution created"),
            ProgressEvent::ExecutionTransition {
                execution_id,
                from,
                to,
                ..
            } => info!(%execution_id, %from, %to, "release execution transition"),
            ProgressEvent::StageTransition {
                execution_id,
                stage_execution_id,
                label,
                from,
                to,
                ..
            } => info!(
                %execution_id,
                %stage_execution_id,
                %label,
                %from,
                %to,
                "stage transition"
            ),
            ProgressEvent::ApprovalRecorded {
                execution_id,
                stage_execution_id,
                record,
            } => info!(
                %execution_id,
                %stage_execution_id,
                gate = %record.gate,
                decided_by = %record.decided_by,
                approved = record.approved,
                "approval recorded"
            ),
        }
    }
}

/// Fans events out to live subscribers. Events sent while nobody is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Transition helpers
// ---------------------------------------------------------------------------

/// Set a stage status and report the change. No-op when unchanged.
pub(crate) fn set_stage_status(
    sink: &dyn ProgressSink,
    execution_id: Uuid,
    stage: &mut StageExecution,
    to: StageStatus,
) {
    let from = stage.status;
    if from == to {
        return;
    }
    stage.status = to;
    sink.emit(ProgressEvent::StageTransition {
        execution_id,
        stage_execution_id: stage.id,
        label: stage.label.clone(),
        from,
        to,
        at: Utc::now(),
    });
}

/// Set the execution status and report the change. No-op when unchanged.
pub(crate) fn set_execution_status(
    sink: &dyn ProgressSink,
    execution: &mut ReleaseExecution,
    to: ExecutionStatus,
) {
    let from = execution.status;
    if from == to {
        return;
    }
    execution.status = to;
    execution.touch();
    sink.emit(ProgressEvent::ExecutionTransition {
        execution_id: execution.id,
        from,
        to,
        at: Utc::now(),
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let id = Uuid::new_v4();
        sink.emit(ProgressEvent::ExecutionTransition {
            execution_id: id,
            from: ExecutionStatus::Pending,
            to: ExecutionStatus::InProgress,
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ProgressEvent::ExecutionTransition { execution_id, to: ExecutionStatus::InProgress, .. }
                if execution_id == id
        ));
    }

    #[test]
    fn broadcast_sink_without_subscribers_does_not_panic() {
        let sink = BroadcastSink::new(1);
        sink.emit(ProgressEvent::ExecutionCreated {
            execution_id: Uuid::new_v4(),
            release_id: 1,
            release_number: "1.0-1".into(),
            at: Utc::now(),
        });
    }

    #[test]
    fn event_json_is_tagged() {
        let event = ProgressEvent::StageTransition {
            execution_id: Uuid::nil(),
            stage_execution_id: Uuid::nil(),
            label: "staging".into(),
            from: StageStatus::Pending,
            to: StageStatus::AwaitingApproval,
            at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"stage_transition\""));
        assert!(json.contains("\"to\":\"awaiting_approval\""));
    }
}
