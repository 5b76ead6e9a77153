//! Agent dispatch for the CLI: runs the configured shell command per member.

use async_trait::async_trait;
use rollout_core::config::DispatchConfig;
use rollout_core::executor::{
    AgentDispatch, CancelSignal, DispatchError, DispatchOutcome, DispatchReport, DispatchRequest,
};
use rollout_core::planner::MemberTarget;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lines of combined output kept on the stage execution.
const OUTPUT_TAIL_LINES: usize = 50;

pub struct ShellDispatcher {
    root: PathBuf,
    config: DispatchConfig,
}

impl ShellDispatcher {
    pub fn new(root: PathBuf, config: DispatchConfig) -> Self {
        Self { root, config }
    }
}

/// Environment handed to the deploy command.
fn command_env(request: &DispatchRequest) -> Vec<(String, String)> {
    let mut env = vec![
        ("ROLLOUT_EXECUTION_ID".to_string(), request.execution_id.to_string()),
        (
            "ROLLOUT_STAGE_EXECUTION_ID".to_string(),
            request.stage_execution_id.to_string(),
        ),
        ("ROLLOUT_RELEASE_ID".to_string(), request.release_id.to_string()),
        ("ROLLOUT_RELEASE_NUMBER".to_string(), request.release_number.clone()),
        ("ROLLOUT_TARGET".to_string(), request.label.clone()),
    ];
    match &request.target {
        MemberTarget::Stage { environment_id, .. } => {
            env.push(("ROLLOUT_TARGET_KIND".into(), "environment".into()));
            env.push(("ROLLOUT_ENVIRONMENT_ID".into(), environment_id.to_string()));
        }
        MemberTarget::Pipeline { pipeline_id, .. } => {
            env.push(("ROLLOUT_TARGET_KIND".into(), "pipeline".into()));
            env.push(("ROLLOUT_PIPELINE_ID".into(), pipeline_id.to_string()));
        }
    }
    if let Some(agent) = request.agent_id {
        env.push(("ROLLOUT_AGENT_ID".into(), agent.to_string()));
    }
    if let Some(version) = &request.artifact_version {
        env.push(("ROLLOUT_ARTIFACT_VERSION".into(), version.clone()));
    }
    for (key, value) in &request.parameters {
        env.push((format!("ROLLOUT_PARAM_{}", env_key(key)), value.clone()));
    }
    env
}

/// `region-name` → `REGION_NAME`.
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn collect_lines<R>(reader: R) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut out = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            out.push(line);
        }
        out
    })
}

fn tail(lines: &[String]) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

#[async_trait]
impl AgentDispatch for ShellDispatcher {
    async fn dispatch(
        &self,
        request: DispatchRequest,
        mut cancel: CancelSignal,
    ) -> Result<DispatchReport, DispatchError> {
        let command = self
            .config
            .command_for(&request.target, &request.label)
            .ok_or_else(|| {
                DispatchError::Unreachable(format!(
                    "no dispatch command configured for '{}'",
                    request.label
                ))
            })?;
        debug!(label = %request.label, %command, "running deploy command");

        let mut child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .envs(command_env(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DispatchError::Unreachable(format!("failed to spawn '{}': {e}", self.config.shell))
            })?;

        let stdout = child
            .stdout
            .take()
            .map(collect_lines)
            .ok_or_else(|| DispatchError::CommandFailed("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .map(collect_lines)
            .ok_or_else(|| DispatchError::CommandFailed("failed to capture stderr".into()))?;

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = status else {
            if let Err(e) = child.kill().await {
                warn!(label = %request.label, error = %e, "failed to kill cancelled deploy command");
            }
            return Err(DispatchError::Cancelled);
        };
        let status = status.map_err(|e| DispatchError::CommandFailed(format!("wait failed: {e}")))?;

        let mut lines = stdout.await.unwrap_or_default();
        let err_lines = stderr.await.unwrap_or_default();
        let last_err = err_lines.last().cloned();
        lines.extend(err_lines);

        if status.success() {
            Ok(DispatchReport {
                outcome: DispatchOutcome::Succeeded,
                output: tail(&lines),
            })
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(DispatchError::CommandFailed(match last_err {
                Some(line) => format!("exit status {code}: {line}"),
                None => format!("exit status {code}"),
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_core::executor::CancelHandle;
    use rollout_core::types::ExecutionMode;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn request(label: &str) -> DispatchRequest {
        let mut parameters = BTreeMap::new();
        parameters.insert("region-name".to_string(), "eu".to_string());
        DispatchRequest {
            execution_id: Uuid::new_v4(),
            stage_execution_id: Uuid::new_v4(),
            release_id: 4,
            release_number: "2.1-3".into(),
            label: label.into(),
            target: MemberTarget::Pipeline {
                link_id: 1,
                pipeline_id: 9,
                pipeline_name: Some(label.into()),
                execution_mode: ExecutionMode::Sequential,
                parameters: BTreeMap::new(),
            },
            agent_id: Some(3),
            artifact_version: None,
            parameters,
        }
    }

    fn dispatcher(dir: &TempDir, command: &str) -> ShellDispatcher {
        let config = DispatchConfig {
            default_command: Some(command.into()),
            ..DispatchConfig::default()
        };
        ShellDispatcher::new(dir.path().to_path_buf(), config)
    }

    #[test]
    fn parameter_keys_become_env_names() {
        assert_eq!(env_key("region-name"), "REGION_NAME");
        assert_eq!(env_key("tier"), "TIER");
    }

    #[tokio::test]
    async fn command_sees_rollout_environment() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(
            &dir,
            "echo $ROLLOUT_RELEASE_NUMBER $ROLLOUT_TARGET_KIND $ROLLOUT_PIPELINE_ID $ROLLOUT_PARAM_REGION_NAME",
        );
        let report = d
            .dispatch(request("build"), CancelHandle::new().signal())
            .await
            .unwrap();
        assert_eq!(report.outcome, DispatchOutcome::Succeeded);
        assert_eq!(report.output.as_deref(), Some("2.1-3 pipeline 9 eu"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_failed() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir, "echo boom >&2; exit 3");
        let err = d
            .dispatch(request("build"), CancelHandle::new().signal())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::CommandFailed("exit status 3: boom".into()));
    }

    #[tokio::test]
    async fn missing_shell_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let config = DispatchConfig {
            shell: "/nonexistent/shell".into(),
            default_command: Some("true".into()),
            ..DispatchConfig::default()
        };
        let d = ShellDispatcher::new(dir.path().to_path_buf(), config);
        let err = d
            .dispatch(request("build"), CancelHandle::new().signal())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable(_)));
    }

    #[tokio::test]
    async fn unconfigured_target_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let d = ShellDispatcher::new(dir.path().to_path_buf(), DispatchConfig::default());
        let err = d
            .dispatch(request("build"), CancelHandle::new().signal())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable(m) if m.contains("build")));
    }

    #[tokio::test]
    async fn cancellation_kills_the_command() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir, "sleep 30");
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let task = tokio::spawn(async move { d.dispatch(request("build"), signal).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.cancel();
        assert_eq!(task.await.unwrap(), Err(DispatchError::Cancelled));
    }
}
