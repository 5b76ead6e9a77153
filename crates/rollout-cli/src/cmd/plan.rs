use crate::output::{print_json, print_table};
use anyhow::Context;
use rollout_core::gatekeeper;
use rollout_core::planner::{self, MemberTarget};
use rollout_core::store::{DefinitionCatalog, ReleaseDefinitionStore};
use std::path::Path;

pub fn run(root: &Path, customer_id: u64, release_id: u64, json: bool) -> anyhow::Result<()> {
    let catalog = DefinitionCatalog::load(root).context("failed to load definitions")?;
    let release = catalog.get_release(customer_id, release_id)?;
    let plan = planner::plan(&release)?;

    if json {
        return print_json(&plan);
    }

    println!(
        "Release {} '{}' v{}: {} unit(s), {} member(s)\n",
        release.id,
        release.name,
        release.version,
        plan.units.len(),
        plan.member_count()
    );

    let mut rows = Vec::new();
    for (i, unit) in plan.units.iter().enumerate() {
        let mode = if unit.is_parallel() { "parallel" } else { "sequential" };
        for member in unit.members() {
            let environment = member
                .target
                .environment_id()
                .map(|id| catalog.get_environment(customer_id, id))
                .transpose()?;
            let target = match (&member.target, &environment) {
                (_, Some(env)) => env.name.clone(),
                (MemberTarget::Pipeline { pipeline_id, pipeline_name, .. }, None) => pipeline_name
                    .clone()
                    .unwrap_or_else(|| format!("pipeline-{pipeline_id}")),
                (MemberTarget::Stage { environment_id, .. }, None) => {
                    format!("environment-{environment_id}")
                }
            };

            let mut gates = Vec::new();
            if gatekeeper::requires_pre_approval(&member.target, environment.as_ref()) {
                gates.push("pre");
            }
            if gatekeeper::requires_post_approval(&member.target) {
                gates.push("post");
            }

            rows.push(vec![
                i.to_string(),
                member.order_index.to_string(),
                mode.to_string(),
                target,
                if gates.is_empty() { "-".to_string() } else { gates.join(",") },
            ]);
        }
    }
    print_table(&["UNIT", "ORDER", "MODE", "TARGET", "GATES"], rows);
    Ok(())
}
