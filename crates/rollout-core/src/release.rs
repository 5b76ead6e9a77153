//! Release definitions: the immutable shape of a release and its targets.

use crate::types::{ExecutionMode, ReleaseStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// A deployment target. `requires_approval` gates every stage that targets it,
/// regardless of the stage's own flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: u64,
    pub name: String,
    pub customer_id: u64,
    #[serde(default)]
    pub requires_approval: bool,
}

// ---------------------------------------------------------------------------
// ReleaseStage
// ---------------------------------------------------------------------------

/// One environment-targeted step of an environment-based release.
///
/// `order_index` is optional on input so a missing index surfaces as a
/// planning error instead of a parse error. Stages sharing an index run as
/// parallel peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseStage {
    pub id: u64,
    pub environment_id: u64,
    #[serde(default)]
    pub order_index: Option<u32>,
    #[serde(default)]
    pub pre_deployment_approval: bool,
    #[serde(default)]
    pub post_deployment_approval: bool,
    #[serde(default = "default_auto_deploy")]
    pub auto_deploy: bool,
    /// Agent pinned to this stage; overrides the agent on the deploy request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<u64>,
}

fn default_auto_deploy() -> bool {
    true
}

// ---------------------------------------------------------------------------
// ReleasePipelineLink
// ---------------------------------------------------------------------------

/// One pipeline-targeted step of a pipeline-based release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePipelineLink {
    pub id: u64,
    pub pipeline_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default)]
    pub order_index: Option<u32>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<u64>,
    /// Default pipeline parameters; deploy-time parameters override these.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// ReleaseTargets
// ---------------------------------------------------------------------------

/// A release deploys either through environments or through pipelines, never
/// both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTargets {
    Stages(Vec<ReleaseStage>),
    Pipelines(Vec<ReleasePipelineLink>),
}

impl ReleaseTargets {
    pub fn len(&self) -> usize {
        match self {
            ReleaseTargets::Stages(s) => s.len(),
            ReleaseTargets::Pipelines(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReleaseTargets::Stages(_) => "environment",
            ReleaseTargets::Pipelines(_) => "pipeline",
        }
    }
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: u64,
    pub name: String,
    pub version: String,
    pub customer_id: u64,
    #[serde(default)]
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Written as a single-key map: `targets: { stages: [...] }` or
    /// `targets: { pipelines: [...] }`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub targets: ReleaseTargets,
}

impl Release {
    /// Environment ids referenced by stages, deduplicated, in definition order.
    pub fn environment_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        if let ReleaseTargets::Stages(stages) = &self.targets {
            for stage in stages {
                if !ids.contains(&stage.environment_id) {
                    ids.push(stage.environment_id);
                }
            }
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
