use super::{drive, orchestrator, report};
use anyhow::Context;
use rollout_core::gatekeeper::ApprovalDecision;
use std::path::Path;
use uuid::Uuid;

pub fn run(
    root: &Path,
    execution_id: Uuid,
    stage_execution_id: Uuid,
    by: &str,
    approved: bool,
    comment: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let orch = orchestrator(root)?;
    let decision = ApprovalDecision {
        execution_id,
        stage_execution_id,
        decided_by: by.to_string(),
        approved,
        comment,
    };
    let verb = if approved { "approve" } else { "reject" };
    let execution = drive(&orch, orch.decide(decision))?
        .with_context(|| format!("failed to {verb} stage execution {stage_execution_id}"))?;
    report(&execution, json)
}
