//! Approval gatekeeper.
//!
//! Per member: `pending → awaiting_approval → {approved, rejected}`, or
//! straight to dispatch when no gate applies. A unit is held while any of its
//! members awaits a decision; ungated siblings wait with it.

use crate::error::{Result, RolloutError};
use crate::execution::{ApprovalRecord, ReleaseExecution, StageExecution};
use crate::planner::MemberTarget;
use crate::progress::{set_stage_status, ProgressEvent, ProgressSink};
use crate::release::Environment;
use crate::types::{ApprovalGate, ApprovalStatus, StageStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// Inbound human decision for an `awaiting_approval` stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub execution_id: Uuid,
    pub stage_execution_id: Uuid,
    pub decided_by: String,
    pub approved: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitReadiness {
    /// Every non-terminal member may be dispatched; ids in plan order.
    Ready(Vec<Uuid>),
    /// At least one member awaits a decision.
    Held(Vec<Uuid>),
}

/// A stage is gated when its own flag, its environment, or a disabled
/// `auto_deploy` says so. Pipeline links carry no gate.
pub fn requires_pre_approval(target: &MemberTarget, environment: Option<&Environment>) -> bool {
    match target {
        MemberTarget::Stage {
            pre_deployment_approval,
            auto_deploy,
            ..
        } => {
            *pre_deployment_approval
                || !*auto_deploy
                || environment.is_some_and(|e| e.requires_approval)
        }
        MemberTarget::Pipeline { .. } => false,
    }
}

pub fn requires_post_approval(target: &MemberTarget) -> bool {
    matches!(
        target,
        MemberTarget::Stage {
            post_deployment_approval: true,
            ..
        }
    )
}

/// Evaluate the pre-deployment gate for every member of a unit.
///
/// Members never evaluated before are moved to `awaiting_approval` when they
/// require approval. Members already approved stay ready.
pub fn enter_unit(
    sink: &dyn ProgressSink,
    execution: &mut ReleaseExecution,
    unit_index: usize,
    environments: &HashMap<u64, Environment>,
) -> UnitReadiness {
    let execution_id = execution.id;
    let mut ready = Vec::new();
    let mut awaiting = Vec::new();

    for stage in execution.unit_mut(unit_index) {
        if stage.status == StageStatus::Pending && stage.approval_status.is_none() {
            let env = stage
                .target
                .environment_id()
                .and_then(|id| environments.get(&id));
            if requires_pre_approval(&stage.target, env) {
                open_gate(sink, execution_id, stage, ApprovalGate::PreDeployment);
            }
        }

        match stage.status {
            StageStatus::AwaitingApproval => awaiting.push(stage.id),
            _ if stage.is_ready() => ready.push(stage.id),
            _ => {}
        }
    }

    if awaiting.is_empty() {
        UnitReadiness::Ready(ready)
    } else {
        info!(%execution_id, unit = unit_index, awaiting = awaiting.len(), "unit held for approval");
        UnitReadiness::Held(awaiting)
    }
}

/// Hold a member that just deployed successfully for post-deployment sign-off.
pub fn open_post_gate(sink: &dyn ProgressSink, execution_id: Uuid, stage: &mut StageExecution) {
    open_gate(sink, execution_id, stage, ApprovalGate::PostDeployment);
}

fn open_gate(
    sink: &dyn ProgressSink,
    execution_id: Uuid,
    stage: &mut StageExecution,
    gate: ApprovalGate,
) {
    stage.approval_status = Some(ApprovalStatus::Pending);
    stage.approval_gate = Some(gate);
    set_stage_status(sink, execution_id, stage, StageStatus::AwaitingApproval);
}

/// Apply a human decision to a member awaiting approval.
///
/// Approving a pre-deployment gate returns the member to `pending` for
/// dispatch; approving a post-deployment gate completes it. Rejection is
/// terminal for the member.
pub fn decide(
    sink: &dyn ProgressSink,
    execution: &mut ReleaseExecution,
    decision: &ApprovalDecision,
) -> Result<()> {
    let execution_id = execution.id;
    if execution.is_terminal() {
        return Err(RolloutError::InvalidTransition {
            from: execution.status.to_string(),
            to: "approval".into(),
            reason: "release execution is already finished".into(),
        });
    }

    let stage = execution
        .stage_mut(decision.stage_execution_id)
        .ok_or(RolloutError::StageExecutionNotFound(decision.stage_execution_id))?;

    let gate = match (stage.status, stage.approval_status, stage.approval_gate) {
        (StageStatus::AwaitingApproval, Some(ApprovalStatus::Pending), Some(gate)) => gate,
        _ => {
            return Err(RolloutError::InvalidTransition {
                from: stage.status.to_string(),
                to: if decision.approved {
                    "approved".into()
                } else {
                    "rejected".into()
                },
                reason: format!("stage execution '{}' is not awaiting approval", stage.label),
            })
        }
    };

    let now = Utc::now();
    let record = ApprovalRecord {
        gate,
        decided_by: decision.decided_by.clone(),
        approved: decision.approved,
        comment: decision.comment.clone(),
        decided_at: now,
    };
    stage.approvals.push(record.clone());
    stage.approved_by = Some(decision.decided_by.clone());
    stage.approval_comment = decision.comment.clone();
    sink.emit(ProgressEvent::ApprovalRecorded {
        execution_id,
        stage_execution_id: stage.id,
        record,
    });

    if decision.approved {
        stage.approval_status = Some(ApprovalStatus::Approved);
        let next = match gate {
            ApprovalGate::PreDeployment => StageStatus::Pending,
            ApprovalGate::PostDeployment => StageStatus::Succeeded,
        };
        set_stage_status(sink, execution_id, stage, next);
    } else {
        stage.approval_status = Some(ApprovalStatus::Rejected);
        stage.error = Some(match &decision.comment {
            Some(c) => format!("{gate} approval rejected by {}: {c}", decision.decided_by),
            None => format!("{gate} approval rejected by {}", decision.decided_by),
        });
        if stage.completed_at.is_none() {
            stage.completed_at = Some(now);
        }
        set_stage_status(sink, execution_id, stage, StageStatus::Failed);
    }

    info!(
        %execution_id,
        stage_execution_id = %decision.stage_execution_id,
        %gate,
        approved = decision.approved,
        decided_by = %decision.decided_by,
        "approval decision applied"
    );
    execution.touch();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
