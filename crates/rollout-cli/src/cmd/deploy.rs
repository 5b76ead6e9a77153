use super::{drive, orchestrator, report};
use anyhow::Context;
use clap::Args;
use rollout_core::execution::DeployRequest;
use std::path::Path;

#[derive(Args)]
pub struct DeployArgs {
    #[arg(long)]
    pub release: u64,

    #[arg(long)]
    pub customer: u64,

    /// Agent used for members without a pinned agent
    #[arg(long)]
    pub agent: Option<u64>,

    #[arg(long)]
    pub artifact_version: Option<String>,

    /// Deploy parameter, repeatable (KEY=VALUE)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Recorded as the trigger of this execution
    #[arg(long)]
    pub by: Option<String>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

pub fn run(root: &Path, args: DeployArgs, json: bool) -> anyhow::Result<()> {
    let orch = orchestrator(root)?;

    let mut request = DeployRequest::new(args.customer, args.release);
    request.agent_id = args.agent;
    request.artifact_version = args.artifact_version;
    request.parameters = args.params.into_iter().collect();
    request.triggered_by = args.by;

    let execution = drive(&orch, orch.deploy(request))?
        .with_context(|| format!("failed to deploy release {}", args.release))?;
    report(&execution, json)
}
