//! Read-only access to release and environment definitions.
//!
//! Every lookup carries the caller's customer scope. A definition that exists
//! under another customer is reported as not found.

use crate::config::ConfigWarning;
use crate::error::{Result, RolloutError};
use crate::paths;
use crate::planner;
use crate::release::{Environment, Release, ReleaseTargets};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub trait ReleaseDefinitionStore: Send + Sync {
    fn get_release(&self, customer_id: u64, release_id: u64) -> Result<Release>;
    fn get_environment(&self, customer_id: u64, environment_id: u64) -> Result<Environment>;
}

// ---------------------------------------------------------------------------
// DefinitionCatalog
// ---------------------------------------------------------------------------

/// Definitions loaded from `.rollout/definitions.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionCatalog {
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub releases: Vec<Release>,
}

impl DefinitionCatalog {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::definitions_path(root);
        if !path.exists() {
            return Err(RolloutError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let catalog: DefinitionCatalog = serde_yaml::from_str(&data)?;
        Ok(catalog)
    }

    /// Structural checks across the whole catalog. Errors here mean a deploy
    /// of the affected release would be rejected.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.id) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate environment id {}",
                    env.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for release in &self.releases {
            if !seen.insert(release.id) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate release id {}",
                    release.id
                )));
            }

            if let Err(e) = planner::plan(release) {
                warnings.push(ConfigWarning::error(format!("release {}: {e}", release.id)));
            }

            if let ReleaseTargets::Stages(stages) = &release.targets {
                for stage in stages {
                    match self.environments.iter().find(|e| e.id == stage.environment_id) {
                        None => warnings.push(ConfigWarning::error(format!(
                            "release {} stage {} targets unknown environment {}",
                            release.id, stage.id, stage.environment_id
                        ))),
                        Some(env) if env.customer_id != release.customer_id => {
                            warnings.push(ConfigWarning::error(format!(
                                "release {} stage {} targets environment {} of another customer",
                                release.id, stage.id, stage.environment_id
                            )))
                        }
                        Some(_) => {}
                    }
                }
            }

            if release.status != crate::types::ReleaseStatus::Active {
                warnings.push(ConfigWarning::warning(format!(
                    "release {} is {} and cannot be deployed",
                    release.id, release.status
                )));
            }
        }

        warnings
    }
}

impl ReleaseDefinitionStore for DefinitionCatalog {
    fn get_release(&self, customer_id: u64, release_id: u64) -> Result<Release> {
        self.releases
            .iter()
            .find(|r| r.id == release_id && r.customer_id == customer_id)
            .cloned()
            .ok_or(RolloutError::ReleaseNotFound(release_id))
    }

    fn get_environment(&self, customer_id: u64, environment_id: u64) -> Result<Environment> {
        self.environments
            .iter()
            .find(|e| e.id == environment_id && e.customer_id == customer_id)
            .cloned()
            .ok_or(RolloutError::EnvironmentNotFound(environment_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
