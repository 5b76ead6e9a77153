//! Execution planner: turns a release definition into ordered execution units.
//!
//! Stages (or pipeline links) are sorted by `order_index` and consecutive
//! equal indices are grouped. A group becomes one [`ExecutionUnit`]:
//!
//! ```text
//! order_index   0        1          1          2
//!             [dev] → [qa-eu ∥ qa-us] → [prod]
//!             Sequential  Parallel     Sequential
//! ```
//!
//! Pipeline links sharing an index must agree on `execution_mode`. A
//! `sequential` group of several links is laid out as one unit per link, in
//! definition order. The planner never looks at approval state.

use crate::error::{Result, RolloutError};
use crate::release::{Release, ReleasePipelineLink, ReleaseStage, ReleaseTargets};
use crate::types::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// MemberTarget
// ---------------------------------------------------------------------------

/// Snapshot of what a unit member deploys to, taken at plan time so a running
/// execution is not affected by later edits to the release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberTarget {
    Stage {
        stage_id: u64,
        environment_id: u64,
        pre_deployment_approval: bool,
        post_deployment_approval: bool,
        auto_deploy: bool,
    },
    Pipeline {
        link_id: u64,
        pipeline_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline_name: Option<String>,
        execution_mode: ExecutionMode,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parameters: BTreeMap<String, String>,
    },
}

impl MemberTarget {
    pub fn environment_id(&self) -> Option<u64> {
        match self {
            MemberTarget::Stage { environment_id, .. } => Some(*environment_id),
            MemberTarget::Pipeline { .. } => None,
        }
    }

    /// Definition id of the stage or link this member came from.
    pub fn definition_id(&self) -> u64 {
        match self {
            MemberTarget::Stage { stage_id, .. } => *stage_id,
            MemberTarget::Pipeline { link_id, .. } => *link_id,
        }
    }
}

// ---------------------------------------------------------------------------
// UnitMember / ExecutionUnit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMember {
    pub order_index: u32,
    pub target: MemberTarget,
    pub agent_id: Option<u64>,
}

impl UnitMember {
    fn from_stage(stage: &ReleaseStage, order_index: u32) -> Self {
        Self {
            order_index,
            target: MemberTarget::Stage {
                stage_id: stage.id,
                environment_id: stage.environment_id,
                pre_deployment_approval: stage.pre_deployment_approval,
                post_deployment_approval: stage.post_deployment_approval,
                auto_deploy: stage.auto_deploy,
            },
            agent_id: stage.agent_id,
        }
    }

    fn from_link(link: &ReleasePipelineLink, order_index: u32) -> Self {
        Self {
            order_index,
            target: MemberTarget::Pipeline {
                link_id: link.id,
                pipeline_id: link.pipeline_id,
                pipeline_name: link.pipeline_name.clone(),
                execution_mode: link.execution_mode,
                parameters: link.parameters.clone(),
            },
            agent_id: link.agent_id,
        }
    }
}

/// One barrier-joined step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "members", rename_all = "snake_case")]
pub enum ExecutionUnit {
    Sequential(UnitMember),
    Parallel(Vec<UnitMember>),
}

impl ExecutionUnit {
    pub fn members(&self) -> &[UnitMember] {
        match self {
            ExecutionUnit::Sequential(m) => std::slice::from_ref(m),
            ExecutionUnit::Parallel(ms) => ms,
        }
    }

    pub fn order_index(&self) -> u32 {
        self.members()[0].order_index
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, ExecutionUnit::Parallel(_))
    }

    fn from_group(mut members: Vec<UnitMember>) -> Self {
        if members.len() == 1 {
            ExecutionUnit::Sequential(members.remove(0))
        } else {
            ExecutionUnit::Parallel(members)
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub release_id: u64,
    pub units: Vec<ExecutionUnit>,
}

impl ExecutionPlan {
    pub fn member_count(&self) -> usize {
        self.units.iter().map(|u| u.members().len()).sum()
    }
}

/// Plan a release.
///
/// Fails with [`RolloutError::Configuration`] when the release is empty, an
/// `order_index` is missing, or links sharing an index mix execution modes.
pub fn plan(release: &Release) -> Result<ExecutionPlan> {
    if release.targets.is_empty() {
        return Err(RolloutError::Configuration(format!(
            "release {} has no {} targets",
            release.id,
            release.targets.kind()
        )));
    }

    let units = match &release.targets {
        ReleaseTargets::Stages(stages) => plan_stages(release.id, stages)?,
        ReleaseTargets::Pipelines(links) => plan_links(release.id, links)?,
    };

    Ok(ExecutionPlan {
        release_id: release.id,
        units,
    })
}

fn require_index(release_id: u64, kind: &str, id: u64, index: Option<u32>) -> Result<u32> {
    index.ok_or_else(|| {
        RolloutError::Configuration(format!(
            "release {release_id}: {kind} {id} has no order_index"
        ))
    })
}

/// Stable sort by index, then split into runs of equal index.
fn group_by_index<T>(mut items: Vec<(u32, T)>) -> Vec<(u32, Vec<T>)> {
    items.sort_by_key(|(idx, _)| *idx);
    let mut groups: Vec<(u32, Vec<T>)> = Vec::new();
    for (idx, item) in items {
        match groups.last_mut() {
            Some((last, group)) if *last == idx => group.push(item),
            _ => groups.push((idx, vec![item])),
        }
    }
    groups
}

fn plan_stages(release_id: u64, stages: &[ReleaseStage]) -> Result<Vec<ExecutionUnit>> {
    let mut indexed = Vec::with_capacity(stages.len());
    for stage in stages {
        let idx = require_index(release_id, "stage", stage.id, stage.order_index)?;
        indexed.push((idx, stage));
    }

    Ok(group_by_index(indexed)
        .into_iter()
        .map(|(idx, group)| {
            let members = group
                .into_iter()
                .map(|s| UnitMember::from_stage(s, idx))
                .collect();
            ExecutionUnit::from_group(members)
        })
        .collect())
}

fn plan_links(release_id: u64, links: &[ReleasePipelineLink]) -> Result<Vec<ExecutionUnit>> {
    let mut indexed = Vec::with_capacity(links.len());
    for link in links {
        let idx = require_index(release_id, "pipeline link", link.id, link.order_index)?;
        indexed.push((idx, link));
    }

    let mut units = Vec::new();
    for (idx, group) in group_by_index(indexed) {
        let mode = group[0].execution_mode;
        if let Some(other) = group.iter().find(|l| l.execution_mode != mode) {
            return Err(RolloutError::Configuration(format!(
                "release {release_id}: order_index {idx} mixes execution modes \
                 (link {} is {mode}, link {} is {})",
                group[0].id, other.id, other.execution_mode
            )));
        }

        match mode {
            ExecutionMode::Parallel => {
                let members = group
                    .into_iter()
                    .map(|l| UnitMember::from_link(l, idx))
                    .collect();
                units.push(ExecutionUnit::from_group(members));
            }
            ExecutionMode::Sequential => {
                units.extend(
                    group
                        .into_iter()
                        .map(|l| ExecutionUnit::Sequential(UnitMember::from_link(l, idx))),
                );
            }
        }
    }
    Ok(units)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReleaseStatus;

    fn stage(id: u64, env: u64, idx: Option<u32>) -> ReleaseStage {
        ReleaseStage {
            id,
            environment_id: env,
            order_index: idx,
            pre_deployment_approval: false,
            post_deployment_approval: false,
            auto_deploy: true,
            agent_id: None,
        }
    }

    fn link(id: u64, idx: u32, mode: ExecutionMode) -> ReleasePipelineLink {
        ReleasePipelineLink {
            id,
            pipeline_id: id * 10,
            pipeline_name: None,
            order_index: Some(idx),
            execution_mode: mode,
            agent_id: None,
            parameters: BTreeMap::new(),
        }
    }

    fn release(targets: ReleaseTargets) -> Release {
        Release {
            id: 1,
            name: "web".into(),
            version: "1.0".into(),
            customer_id: 1,
            status: ReleaseStatus::Active,
            description: None,
            targets,
        }
    }

    fn member_ids(plan: &ExecutionPlan) -> Vec<Vec<u64>> {
        plan.units
            .iter()
            .map(|u| u.members().iter().map(|m| m.target.definition_id()).collect())
            .collect()
    }

    #[test]
    fn empty_release_is_a_configuration_error() {
        let err = plan(&release(ReleaseTargets::Stages(vec![]))).unwrap_err();
        assert!(matches!(err, RolloutError::Configuration(_)));
    }

    #[test]
    fn missing_order_index_is_a_configuration_error() {
        let r = release(ReleaseTargets::Stages(vec![
            stage(1, 1, Some(0)),
            stage(2, 2, None),
        ]));
        let err = plan(&r).unwrap_err();
        assert!(err.to_string().contains("stage 2 has no order_index"));
    }

    #[test]
    fn stages_sorted_and_grouped_by_index() {
        let r = release(ReleaseTargets::Stages(vec![
            stage(3, 3, Some(2)),
            stage(1, 1, Some(0)),
            stage(2, 2, Some(1)),
            stage(4, 4, Some(1)),
        ]));
        let p = plan(&r).unwrap();
        assert_eq!(member_ids(&p), vec![vec![1], vec![2, 4], vec![3]]);
        assert!(!p.units[0].is_parallel());
        assert!(p.units[1].is_parallel());
        assert_eq!(p.member_count(), 4);
    }

    #[test]
    fn order_indices_are_non_decreasing_and_members_unique() {
        let r = release(ReleaseTargets::Stages(vec![
            stage(1, 1, Some(5)),
            stage(2, 1, Some(0)),
            stage(3, 1, Some(5)),
            stage(4, 1, Some(3)),
            stage(5, 1, Some(0)),
        ]));
        let p = plan(&r).unwrap();
        let indices: Vec<u32> = p.units.iter().map(|u| u.order_index()).collect();
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));

        let mut seen: Vec<u64> = member_ids(&p).into_iter().flatten().collect();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn parallel_links_share_one_unit() {
        let r = release(ReleaseTargets::Pipelines(vec![
            link(1, 0, ExecutionMode::Parallel),
            link(2, 0, ExecutionMode::Parallel),
            link(3, 1, ExecutionMode::Sequential),
        ]));
        let p = plan(&r).unwrap();
        assert_eq!(member_ids(&p), vec![vec![1, 2], vec![3]]);
        assert!(matches!(p.units[0], ExecutionUnit::Parallel(_)));
    }

    #[test]
    fn sequential_links_at_same_index_become_separate_units() {
        let r = release(ReleaseTargets::Pipelines(vec![
            link(1, 0, ExecutionMode::Sequential),
            link(2, 0, ExecutionMode::Sequential),
        ]));
        let p = plan(&r).unwrap();
        assert_eq!(member_ids(&p), vec![vec![1], vec![2]]);
        assert_eq!(p.units[0].order_index(), p.units[1].order_index());
    }

    #[test]
    fn single_parallel_link_degenerates_to_sequential() {
        let r = release(ReleaseTargets::Pipelines(vec![link(
            1,
            0,
            ExecutionMode::Parallel,
        )]));
        let p = plan(&r).unwrap();
        assert!(matches!(p.units[0], ExecutionUnit::Sequential(_)));
    }

    #[test]
    fn mixed_modes_at_one_index_are_rejected() {
        let r = release(ReleaseTargets::Pipelines(vec![
            link(1, 0, ExecutionMode::Parallel),
            link(2, 0, ExecutionMode::Sequential),
        ]));
        let err = plan(&r).unwrap_err();
        assert!(matches!(err, RolloutError::Configuration(_)));
        assert!(err.to_string().contains("mixes execution modes"));
    }

    #[test]
    fn stage_flags_are_snapshotted_into_targets() {
        let mut s = stage(1, 9, Some(0));
        s.post_deployment_approval = true;
        s.agent_id = Some(42);
        let p = plan(&release(ReleaseTargets::Stages(vec![s]))).unwrap();
        let member = &p.units[0].members()[0];
        assert_eq!(member.agent_id, Some(42));
        assert!(matches!(
            member.target,
            MemberTarget::Stage {
                environment_id: 9,
                post_deployment_approval: true,
                ..
            }
        ));
    }
}
