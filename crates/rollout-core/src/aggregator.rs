//! Rolls member statuses up into unit and execution statuses.

use crate::execution::ReleaseExecution;
use crate::progress::{set_execution_status, set_stage_status, ProgressSink};
use crate::types::{ApprovalGate, ApprovalStatus, ExecutionStatus, StageStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Held,
    Running,
    Succeeded,
    Failed,
}

/// What the drive loop does after a unit has been folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Unit succeeded; move to the next one.
    Advance,
    /// Unit is waiting on a human decision.
    Pause,
    /// Unit failed; the execution is now `failed`.
    Halt,
    /// Last unit succeeded; the execution is now `succeeded`.
    Complete,
}

/// Status of one unit derived from its members.
///
/// A failure only settles the unit once no member is still in flight, so
/// parallel siblings always finish (or are cancelled) before the unit fails.
pub fn unit_status(execution: &ReleaseExecution, unit_index: usize) -> UnitStatus {
    let mut total = 0;
    let mut succeeded = 0;
    let mut failed = false;
    let mut running = false;
    let mut held = false;

    for stage in execution.unit(unit_index) {
        total += 1;
        match stage.status {
            StageStatus::Succeeded => succeeded += 1,
            StageStatus::Failed => failed = true,
            StageStatus::InProgress => running = true,
            StageStatus::AwaitingApproval => held = true,
            StageStatus::Pending | StageStatus::Skipped => {}
        }
    }

    if running {
        UnitStatus::Running
    } else if failed {
        UnitStatus::Failed
    } else if held {
        UnitStatus::Held
    } else if succeeded == total {
        UnitStatus::Succeeded
    } else if succeeded > 0 {
        UnitStatus::Running
    } else {
        UnitStatus::Pending
    }
}

/// `pending → in_progress` for the execution on its first drive.
pub fn mark_started(sink: &dyn ProgressSink, execution: &mut ReleaseExecution) {
    if execution.status != ExecutionStatus::Pending {
        return;
    }
    execution.started_at = Some(Utc::now());
    set_execution_status(sink, execution, ExecutionStatus::InProgress);
}

/// Fold a unit into the execution and decide how the drive continues.
pub fn fold_unit(
    sink: &dyn ProgressSink,
    execution: &mut ReleaseExecution,
    unit_index: usize,
) -> Continuation {
    match unit_status(execution, unit_index) {
        UnitStatus::Succeeded => {
            if unit_index + 1 < execution.unit_count() {
                Continuation::Advance
            } else {
                finalize(sink, execution, ExecutionStatus::Succeeded);
                info!(execution_id = %execution.id, "release execution succeeded");
                Continuation::Complete
            }
        }
        UnitStatus::Failed => {
            let cause = execution
                .unit(unit_index)
                .find(|s| s.status == StageStatus::Failed)
                .map(|s| match &s.error {
                    Some(e) => format!("{}: {e}", s.label),
                    None => s.label.clone(),
                })
                .unwrap_or_default();
            let error = format!("unit {unit_index} failed: {cause}");
            warn!(execution_id = %execution.id, unit = unit_index, %error, "halting release execution");

            close_remaining(sink, execution);
            execution.error = Some(error);
            finalize(sink, execution, ExecutionStatus::Failed);
            Continuation::Halt
        }
        UnitStatus::Held | UnitStatus::Pending | UnitStatus::Running => Continuation::Pause,
    }
}

/// Finalize a cancelled execution: members that never ran become `skipped`,
/// members still in flight become `failed`.
pub fn cancel_execution(sink: &dyn ProgressSink, execution: &mut ReleaseExecution) {
    execution.cancel_requested = true;
    let execution_id = execution.id;
    for stage in execution.stages.iter_mut() {
        if stage.status == StageStatus::InProgress {
            stage.error = Some("cancelled while in progress".into());
            stage.completed_at = Some(Utc::now());
            set_stage_status(sink, execution_id, stage, StageStatus::Failed);
        }
    }
    close_remaining(sink, execution);
    if execution.error.is_none() {
        execution.error = Some("cancelled".into());
    }
    finalize(sink, execution, ExecutionStatus::Cancelled);
    info!(%execution_id, "release execution cancelled");
}

/// Settle every member the drive will no longer reach.
///
/// Members that never ran become `skipped`. A member held at its
/// post-deployment gate already deployed, so it stays `succeeded` with the
/// gate closed as `unresolved`.
fn close_remaining(sink: &dyn ProgressSink, execution: &mut ReleaseExecution) {
    let execution_id = execution.id;
    for stage in execution.stages.iter_mut() {
        match stage.status {
            StageStatus::Pending => {
                set_stage_status(sink, execution_id, stage, StageStatus::Skipped)
            }
            StageStatus::AwaitingApproval => {
                stage.approval_status = Some(ApprovalStatus::Unresolved);
                let to = match stage.approval_gate {
                    Some(ApprovalGate::PostDeployment) => StageStatus::Succeeded,
                    _ => StageStatus::Skipped,
                };
                set_stage_status(sink, execution_id, stage, to);
            }
            _ => {}
        }
    }
}

fn finalize(sink: &dyn ProgressSink, execution: &mut ReleaseExecution, status: ExecutionStatus) {
    let now = Utc::now();
    execution.completed_at = Some(now);
    let start = execution.started_at.unwrap_or(execution.created_at);
    execution.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
    set_execution_status(sink, execution, status);
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Member counts by status plus per-unit rollup, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    pub members: BTreeMap<String, usize>,
    pub units: Vec<UnitStatus>,
}

pub fn summarize(execution: &ReleaseExecution) -> ExecutionSummary {
    let mut members = BTreeMap::new();
    for stage in &execution.stages {
        *members.entry(stage.status.to_string()).or_insert(0) += 1;
    }
    ExecutionSummary {
        status: execution.status,
        members,
        units: (0..execution.unit_count())
            .map(|i| unit_status(execution, i))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
