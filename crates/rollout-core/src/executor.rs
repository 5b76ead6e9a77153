//! Stage executor: drives one member through the external agent dispatch.
//!
//! Dispatches run as spawned tasks and report [`MemberUpdate`]s over an mpsc
//! channel. Records are only touched by [`StageExecutor::begin`] and
//! [`StageExecutor::finish`], which the orchestrator calls from its own task,
//! so parallel members never mutate shared state directly.
//!
//! With `max_parallel_dispatches` set, a spawned member first waits for a
//! dispatch slot and reports `Started` only once it holds one. A queued member
//! stays `pending`.

use crate::config::OrchestratorConfig;
use crate::execution::{ReleaseExecution, StageExecution};
use crate::gatekeeper;
use crate::planner::MemberTarget;
use crate::progress::{set_stage_status, ProgressSink};
use crate::types::StageStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Dispatch contract
// ---------------------------------------------------------------------------

/// Everything an agent needs to deploy one member.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub execution_id: Uuid,
    pub stage_execution_id: Uuid,
    pub release_id: u64,
    pub release_number: String,
    pub label: String,
    pub target: MemberTarget,
    pub agent_id: Option<u64>,
    pub artifact_version: Option<String>,
    /// Link defaults overlaid with deploy-time parameters.
    pub parameters: BTreeMap<String, String>,
}

impl DispatchRequest {
    pub fn for_stage(execution: &ReleaseExecution, stage: &StageExecution) -> Self {
        let mut parameters = match &stage.target {
            MemberTarget::Pipeline { parameters, .. } => parameters.clone(),
            MemberTarget::Stage { .. } => BTreeMap::new(),
        };
        parameters.extend(
            execution
                .request
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Self {
            execution_id: execution.id,
            stage_execution_id: stage.id,
            release_id: execution.release_id,
            release_number: execution.release_number.clone(),
            label: stage.label.clone(),
            target: stage.target.clone(),
            agent_id: stage.agent_id,
            artifact_version: execution.request.artifact_version.clone(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    /// Log excerpt returned by the agent.
    pub output: Option<String>,
}

impl DispatchReport {
    pub fn succeeded() -> Self {
        Self {
            outcome: DispatchOutcome::Succeeded,
            output: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: DispatchOutcome::Failed {
                reason: reason.into(),
            },
            output: None,
        }
    }
}

/// Dispatch-level failures, distinct from a deployment that ran and failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("dispatch timed out after {0}s")]
    TimedOut(u64),

    #[error("dispatch cancelled")]
    Cancelled,
}

/// The external agent capability. Implementations should be safe to call again
/// for the same stage execution; retrying is left to the caller.
#[async_trait]
pub trait AgentDispatch: Send + Sync {
    async fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: CancelSignal,
    ) -> Result<DispatchReport, DispatchError>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Sending half of a best-effort stop signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half handed to dispatches.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemberOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MemberOutcome {
    pub stage_execution_id: Uuid,
    pub result: Result<DispatchReport, DispatchError>,
    pub completed_at: DateTime<Utc>,
}

impl MemberOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.result,
            Ok(DispatchReport {
                outcome: DispatchOutcome::Succeeded,
                ..
            })
        )
    }
}

/// What a spawned dispatch task reports back to the drive task.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberUpdate {
    /// Holds a dispatch slot and is calling the agent.
    Started {
        stage_execution_id: Uuid,
        at: DateTime<Utc>,
    },
    Finished(MemberOutcome),
}

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StageExecutor {
    dispatcher: Arc<dyn AgentDispatch>,
    timeout: Option<Duration>,
    permits: Option<Arc<Semaphore>>,
}

impl StageExecutor {
    pub fn new(dispatcher: Arc<dyn AgentDispatch>, config: &OrchestratorConfig) -> Self {
        let timeout = match config.dispatch_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let permits = match config.max_parallel_dispatches {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            dispatcher,
            timeout,
            permits,
        }
    }

    /// `pending → in_progress`.
    pub fn begin(
        &self,
        sink: &dyn ProgressSink,
        execution_id: Uuid,
        stage: &mut StageExecution,
        started_at: DateTime<Utc>,
    ) {
        stage.started_at = Some(started_at);
        stage.completed_at = None;
        stage.duration_ms = None;
        stage.error = None;
        set_stage_status(sink, execution_id, stage, StageStatus::InProgress);
    }

    /// Dispatch in a background task. Sends `Started` once a dispatch slot is
    /// held, then `Finished`. A member cancelled while queued sends nothing
    /// and is left `pending`.
    pub fn spawn(
        &self,
        request: DispatchRequest,
        cancel: CancelSignal,
        tx: mpsc::Sender<MemberUpdate>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let stage_execution_id = request.stage_execution_id;
            let mut queued = cancel.clone();
            let _permit = tokio::select! {
                biased;
                _ = queued.cancelled() => {
                    debug!(%stage_execution_id, "cancelled while waiting for a dispatch slot");
                    return;
                }
                permit = this.acquire() => permit,
            };

            let started = MemberUpdate::Started {
                stage_execution_id,
                at: Utc::now(),
            };
            if tx.send(started).await.is_err() {
                warn!(%stage_execution_id, "orchestrator stopped listening before dispatch");
                return;
            }

            let outcome = this.run(request, cancel).await;
            if tx.send(MemberUpdate::Finished(outcome)).await.is_err() {
                warn!(%stage_execution_id, "member outcome dropped: orchestrator stopped listening");
            }
        })
    }

    /// Wait for a dispatch slot. `None` when dispatches are unbounded.
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.permits {
            // the semaphore is never closed
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    /// Dispatch one member, bounded by the configured timeout and raced
    /// against `cancel`.
    pub async fn run(&self, request: DispatchRequest, mut cancel: CancelSignal) -> MemberOutcome {
        let stage_execution_id = request.stage_execution_id;
        debug!(%stage_execution_id, label = %request.label, "dispatching");

        let result = tokio::select! {
            r = self.dispatch_bounded(request, cancel.clone()) => r,
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        };

        MemberOutcome {
            stage_execution_id,
            result,
            completed_at: Utc::now(),
        }
    }

    async fn dispatch_bounded(
        &self,
        request: DispatchRequest,
        cancel: CancelSignal,
    ) -> Result<DispatchReport, DispatchError> {
        let fut = self.dispatcher.dispatch(request, cancel);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(DispatchError::TimedOut(limit.as_secs()))),
            None => fut.await,
        }
    }

    /// `in_progress → succeeded | failed`, or `in_progress → awaiting_approval`
    /// when a successful member has a post-deployment gate.
    pub fn finish(
        &self,
        sink: &dyn ProgressSink,
        execution_id: Uuid,
        stage: &mut StageExecution,
        outcome: MemberOutcome,
    ) {
        stage.completed_at = Some(outcome.completed_at);
        stage.duration_ms = stage
            .started_at
            .map(|s| (outcome.completed_at - s).num_milliseconds().max(0) as u64);

        match outcome.result {
            Ok(report) => {
                stage.output = report.output;
                match report.outcome {
                    DispatchOutcome::Succeeded => {
                        if gatekeeper::requires_post_approval(&stage.target) {
                            gatekeeper::open_post_gate(sink, execution_id, stage);
                        } else {
                            set_stage_status(sink, execution_id, stage, StageStatus::Succeeded);
                        }
                    }
                    DispatchOutcome::Failed { reason } => {
                        warn!(%execution_id, stage_execution_id = %stage.id, %reason, "deployment failed");
                        stage.error = Some(reason);
                        set_stage_status(sink, execution_id, stage, StageStatus::Failed);
                    }
                }
            }
            Err(e) => {
                warn!(%execution_id, stage_execution_id = %stage.id, error = %e, "dispatch error");
                stage.error = Some(e.to_string());
                set_stage_status(sink, execution_id, stage, StageStatus::Failed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
