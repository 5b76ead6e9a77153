//! Runtime records for one deploy attempt.
//!
//! A [`ReleaseExecution`] owns its [`StageExecution`]s; they are persisted
//! together as one record so the orchestrator can resume from it. Stage
//! executions are stored in plan order and carry their `unit_index`, so a
//! resumed execution never needs to re-plan the (possibly edited) release.

use crate::planner::{ExecutionPlan, MemberTarget};
use crate::release::Release;
use crate::types::{ApprovalGate, ApprovalStatus, ExecutionStatus, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// DeployRequest
// ---------------------------------------------------------------------------

/// Deploy-time parameters. `customer_id` scopes every definition lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub customer_id: u64,
    pub release_id: u64,
    #[serde(default)]
    pub agent_id: Option<u64>,
    #[serde(default)]
    pub artifact_version: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl DeployRequest {
    pub fn new(customer_id: u64, release_id: u64) -> Self {
        Self {
            customer_id,
            release_id,
            agent_id: None,
            artifact_version: None,
            parameters: BTreeMap::new(),
            triggered_by: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalRecord
// ---------------------------------------------------------------------------

/// Append-only record of one human decision on a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub gate: ApprovalGate,
    pub decided_by: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StageExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub id: Uuid,
    pub unit_index: usize,
    pub order_index: u32,
    /// Environment name or pipeline name, for display.
    pub label: String,
    pub target: MemberTarget,
    #[serde(default)]
    pub agent_id: Option<u64>,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    /// The gate currently open (or last decided) on this member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_gate: Option<ApprovalGate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvals: Vec<ApprovalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl StageExecution {
    fn new(unit_index: usize, order_index: u32, label: String, target: MemberTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            unit_index,
            order_index,
            label,
            target,
            agent_id: None,
            status: StageStatus::Pending,
            approval_status: None,
            approval_gate: None,
            approved_by: None,
            approval_comment: None,
            approvals: Vec::new(),
            error: None,
            output: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Pending and either ungated or already approved at the pre-deployment gate.
    pub fn is_ready(&self) -> bool {
        self.status == StageStatus::Pending
            && matches!(self.approval_status, None | Some(ApprovalStatus::Approved))
    }
}

// ---------------------------------------------------------------------------
// ReleaseExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseExecution {
    pub id: Uuid,
    pub release_id: u64,
    pub release_name: String,
    pub customer_id: u64,
    pub release_number: String,
    pub status: ExecutionStatus,
    pub request: DeployRequest,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageExecution>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseExecution {
    /// Build a `Pending` execution with one stage execution per plan member.
    ///
    /// `labels` maps environment ids to display names; pipeline members are
    /// labelled from the link itself.
    pub fn from_plan(
        release: &Release,
        plan: &ExecutionPlan,
        request: DeployRequest,
        sequence: u64,
        labels: &HashMap<u64, String>,
    ) -> Self {
        let mut stages = Vec::with_capacity(plan.member_count());
        for (unit_index, unit) in plan.units.iter().enumerate() {
            for member in unit.members() {
                let label = match &member.target {
                    MemberTarget::Stage { environment_id, .. } => labels
                        .get(environment_id)
                        .cloned()
                        .unwrap_or_else(|| format!("environment-{environment_id}")),
                    MemberTarget::Pipeline {
                        pipeline_id,
                        pipeline_name,
                        ..
                    } => pipeline_name
                        .clone()
                        .unwrap_or_else(|| format!("pipeline-{pipeline_id}")),
                };
                let mut stage = StageExecution::new(
                    unit_index,
                    member.order_index,
                    label,
                    member.target.clone(),
                );
                stage.agent_id = member.agent_id.or(request.agent_id);
                stages.push(stage);
            }
        }

        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            release_id: release.id,
            release_name: release.name.clone(),
            customer_id: request.customer_id,
            release_number: format!("{}-{}", release.version, sequence),
            status: ExecutionStatus::Pending,
            request,
            cancel_requested: false,
            error: None,
            stages,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            updated_at: now,
        }
    }

    pub fn unit_count(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.unit_index + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn unit(&self, unit_index: usize) -> impl Iterator<Item = &StageExecution> {
        self.stages.iter().filter(move |s| s.unit_index == unit_index)
    }

    pub fn unit_mut(&mut self, unit_index: usize) -> impl Iterator<Item = &mut StageExecution> {
        self.stages
            .iter_mut()
            .filter(move |s| s.unit_index == unit_index)
    }

    pub fn stage(&self, id: Uuid) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_mut(&mut self, id: Uuid) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stage executions currently waiting on a human decision.
    pub fn awaiting_approval(&self) -> Vec<&StageExecution> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::AwaitingApproval)
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner;
    use crate::release::{ReleaseStage, ReleaseTargets};
    use crate::types::ReleaseStatus;

    fn release() -> Release {
        let stage = |id: u64, idx: u32| ReleaseStage {
            id,
            environment_id: id,
            order_index: Some(idx),
            pre_deployment_approval: false,
            post_deployment_approval: false,
            auto_deploy: true,
            agent_id: if id == 2 { Some(77) } else { None },
        };
        Release {
            id: 4,
            name: "web".into(),
            version: "1.2".into(),
            customer_id: 3,
            status: ReleaseStatus::Active,
            description: None,
            targets: ReleaseTargets::Stages(vec![stage(1, 0), stage(2, 1), stage(3, 1)]),
        }
    }

    #[test]
    fn from_plan_creates_one_pending_record_per_member() {
        let release = release();
        let plan = planner::plan(&release).unwrap();
        let labels = HashMap::from([(1, "dev".to_string()), (2, "qa".to_string())]);
        let mut request = DeployRequest::new(3, 4);
        request.agent_id = Some(5);

        let exec = ReleaseExecution::from_plan(&release, &plan, request, 2, &labels);
        assert_eq!(exec.release_number, "1.2-2");
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.stages.len(), 3);
        assert_eq!(exec.unit_count(), 2);
        assert_eq!(exec.unit(1).count(), 2);
        assert!(exec.stages.iter().all(|s| s.status == StageStatus::Pending));

        assert_eq!(exec.stages[0].label, "dev");
        assert_eq!(exec.stages[2].label, "environment-3");
        // stage-pinned agent wins over the request agent
        assert_eq!(exec.stages[0].agent_id, Some(5));
        assert_eq!(exec.stages[1].agent_id, Some(77));
    }

    #[test]
    fn execution_json_roundtrip_preserves_stages() {
        let release = release();
        let plan = planner::plan(&release).unwrap();
        let exec =
            ReleaseExecution::from_plan(&release, &plan, DeployRequest::new(3, 4), 1, &HashMap::new());
        let json = serde_json::to_vec(&exec).unwrap();
        let parsed: ReleaseExecution = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, exec);
    }

    #[test]
    fn readiness_depends_on_approval() {
        let release = release();
        let plan = planner::plan(&release).unwrap();
        let mut exec =
            ReleaseExecution::from_plan(&release, &plan, DeployRequest::new(3, 4), 1, &HashMap::new());
        let stage = &mut exec.stages[0];
        assert!(stage.is_ready());
        stage.approval_status = Some(ApprovalStatus::Pending);
        assert!(!stage.is_ready());
        stage.approval_status = Some(ApprovalStatus::Approved);
        assert!(stage.is_ready());
        stage.status = StageStatus::InProgress;
        assert!(!stage.is_ready());
    }
}
