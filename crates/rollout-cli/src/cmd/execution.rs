use super::{drive, orchestrator, report};
use crate::output::{format_duration, print_execution, print_json, print_table};
use anyhow::Context;
use rollout_core::CancelOutcome;
use std::path::Path;
use uuid::Uuid;

pub fn resume(root: &Path, id: Uuid, json: bool) -> anyhow::Result<()> {
    let orch = orchestrator(root)?;
    let execution = drive(&orch, orch.resume(id))?
        .with_context(|| format!("failed to resume release execution {id}"))?;
    report(&execution, json)
}

pub fn cancel(root: &Path, id: Uuid, json: bool) -> anyhow::Result<()> {
    let orch = orchestrator(root)?;
    match orch
        .cancel(id)
        .with_context(|| format!("failed to cancel release execution {id}"))?
    {
        CancelOutcome::Finalized(execution) => {
            if json {
                print_json(&execution)
            } else {
                print_execution(&execution);
                Ok(())
            }
        }
        // only reachable when the drive runs in this process
        CancelOutcome::Signalled => {
            if json {
                print_json(&serde_json::json!({ "id": id, "signalled": true }))
            } else {
                println!("Cancellation signalled for {id}");
                Ok(())
            }
        }
    }
}

pub fn status(root: &Path, id: Uuid, json: bool) -> anyhow::Result<()> {
    let orch = orchestrator(root)?;
    let execution = orch.status(id)?;
    if json {
        print_json(&execution)
    } else {
        print_execution(&execution);
        Ok(())
    }
}

pub fn list(root: &Path, release: Option<u64>, json: bool) -> anyhow::Result<()> {
    let orch = orchestrator(root)?;
    let executions = match release {
        Some(id) => orch.list(id)?,
        None => orch.list_all()?,
    };

    if json {
        return print_json(&executions);
    }
    if executions.is_empty() {
        println!("No release executions.");
        return Ok(());
    }

    let rows = executions
        .iter()
        .map(|e| {
            vec![
                e.id.to_string(),
                e.release_name.clone(),
                e.release_number.clone(),
                e.status.to_string(),
                e.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                format_duration(e.duration_ms),
            ]
        })
        .collect();
    print_table(
        &["ID", "RELEASE", "NUMBER", "STATUS", "CREATED", "DURATION"],
        rows,
    );
    Ok(())
}
