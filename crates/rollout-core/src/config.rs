use crate::error::{Result, RolloutError};
use crate::paths;
use crate::planner::MemberTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

impl ConfigWarning {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SiblingFailurePolicy
// ---------------------------------------------------------------------------

/// What happens to running parallel siblings when one member fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingFailurePolicy {
    /// Let every sibling finish before the unit fails.
    #[default]
    WaitForAll,
    /// Send the stop signal to siblings still in flight.
    CancelSiblings,
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on a single dispatch. `0` disables the timeout.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_seconds: u64,
    /// Concurrent dispatches across one drive. `0` means unbounded.
    #[serde(default)]
    pub max_parallel_dispatches: usize,
    #[serde(default)]
    pub sibling_failure: SiblingFailurePolicy,
}

fn default_dispatch_timeout() -> u64 {
    3600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_seconds: default_dispatch_timeout(),
            max_parallel_dispatches: 0,
            sibling_failure: SiblingFailurePolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// Shell commands the CLI runs to deploy a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_command: Option<String>,
    /// Keyed by environment name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, String>,
    /// Keyed by pipeline id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pipelines: BTreeMap<u64, String>,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_command: None,
            environments: BTreeMap::new(),
            pipelines: BTreeMap::new(),
        }
    }
}

impl DispatchConfig {
    /// Most specific command for a member, falling back to `default_command`.
    pub fn command_for(&self, target: &MemberTarget, label: &str) -> Option<&str> {
        let specific = match target {
            MemberTarget::Stage { .. } => self.environments.get(label),
            MemberTarget::Pipeline { pipeline_id, .. } => self.pipelines.get(pipeline_id),
        };
        specific.or(self.default_command.as_ref()).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            orchestrator: OrchestratorConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(RolloutError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        if cfg.version != default_version() {
            return Err(RolloutError::Configuration(format!(
                "unsupported config version {}",
                cfg.version
            )));
        }
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.orchestrator.dispatch_timeout_seconds == 0 {
            warnings.push(ConfigWarning::warning(
                "orchestrator.dispatch_timeout_seconds is 0: dispatches never time out",
            ));
        }

        if self.dispatch.shell.trim().is_empty() {
            warnings.push(ConfigWarning::error("dispatch.shell is empty"));
        }

        if self.dispatch.default_command.is_none()
            && self.dispatch.environments.is_empty()
            && self.dispatch.pipelines.is_empty()
        {
            warnings.push(ConfigWarning::warning(
                "no dispatch commands configured: every deploy will fail to dispatch",
            ));
        }

        for (name, command) in &self.dispatch.environments {
            if command.trim().is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "dispatch command for environment '{name}' is empty"
                )));
            }
        }
        for (id, command) in &self.dispatch.pipelines {
            if command.trim().is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "dispatch command for pipeline {id} is empty"
                )));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
