//! Release orchestrator: owns the lifecycle of each release execution.
//!
//! A drive walks the execution unit by unit: gate the unit, dispatch its ready
//! members, fold the outcome, then advance, pause or stop. Every state change
//! is persisted before the drive moves on, so a drive can be resumed from the
//! store at any point. At most one drive per execution runs at a time in a
//! process; the drive task is the only writer of that execution's record.

use crate::aggregator::{self, Continuation, UnitStatus};
use crate::config::{OrchestratorConfig, SiblingFailurePolicy};
use crate::db::ExecutionStore;
use crate::error::{Result, RolloutError};
use crate::execution::{DeployRequest, ReleaseExecution};
use crate::executor::{AgentDispatch, CancelHandle, DispatchRequest, MemberUpdate, StageExecutor};
use crate::gatekeeper::{self, ApprovalDecision, UnitReadiness};
use crate::planner;
use crate::progress::{set_stage_status, ProgressEvent, ProgressSink};
use crate::release::Environment;
use crate::store::ReleaseDefinitionStore;
use crate::types::{ApprovalStatus, ExecutionStatus, ReleaseStatus, StageStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of [`Orchestrator::cancel`].
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// A drive is running in this process; it received the stop signal and
    /// will finalize the execution as `cancelled` once in-flight dispatches
    /// return.
    Signalled,
    /// No drive was running; the execution was finalized directly.
    Finalized(ReleaseExecution),
}

pub struct Orchestrator {
    definitions: Arc<dyn ReleaseDefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    executor: StageExecutor,
    sink: Arc<dyn ProgressSink>,
    config: OrchestratorConfig,
    active: Mutex<HashMap<Uuid, Arc<CancelHandle>>>,
    interrupted: AtomicBool,
}

// ---------------------------------------------------------------------------
// Drive registration
// ---------------------------------------------------------------------------

/// Marks an execution as driven by this process until dropped.
struct DriveGuard<'a> {
    active: &'a Mutex<HashMap<Uuid, Arc<CancelHandle>>>,
    id: Uuid,
    cancel: Arc<CancelHandle>,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.id);
    }
}

impl Orchestrator {
    pub fn new(
        definitions: Arc<dyn ReleaseDefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        dispatcher: Arc<dyn AgentDispatch>,
        sink: Arc<dyn ProgressSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            definitions,
            executions,
            executor: StageExecutor::new(dispatcher, &config),
            sink,
            config,
            active: Mutex::new(HashMap::new()),
            interrupted: AtomicBool::new(false),
        }
    }

    fn register(&self, id: Uuid) -> Result<DriveGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(&id) {
            return Err(RolloutError::ExecutionBusy(id));
        }
        let cancel = Arc::new(CancelHandle::new());
        if self.interrupted.load(Ordering::SeqCst) {
            cancel.cancel();
        }
        active.insert(id, cancel.clone());
        Ok(DriveGuard {
            active: &self.active,
            id,
            cancel,
        })
    }

    /// Cancel every drive running in this process and every drive started
    /// after this call. Returns the number of drives signalled.
    pub fn interrupt(&self) -> usize {
        self.interrupted.store(true, Ordering::SeqCst);
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for (id, handle) in active.iter() {
            info!(execution_id = %id, "interrupted, cancelling drive");
            handle.cancel();
        }
        active.len()
    }

    /// Whether a drive for `id` is running in this process.
    pub fn is_active(&self, id: Uuid) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(&id)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Create an execution for a release and drive it until it pauses at a
    /// gate or finishes.
    ///
    /// Definition and planning errors surface before anything is persisted.
    pub async fn deploy(&self, request: DeployRequest) -> Result<ReleaseExecution> {
        let release = self
            .definitions
            .get_release(request.customer_id, request.release_id)?;
        if release.status != ReleaseStatus::Active {
            return Err(RolloutError::ReleaseInactive {
                id: release.id,
                status: release.status.to_string(),
            });
        }
        let plan = planner::plan(&release)?;

        let mut labels = HashMap::new();
        for environment_id in release.environment_ids() {
            let env = self
                .definitions
                .get_environment(request.customer_id, environment_id)?;
            labels.insert(environment_id, env.name);
        }

        let sequence = self.executions.count_for_release(release.id)? + 1;
        let execution = ReleaseExecution::from_plan(&release, &plan, request, sequence, &labels);
        let guard = self.register(execution.id)?;
        self.executions.insert(&execution)?;
        self.sink.emit(ProgressEvent::ExecutionCreated {
            execution_id: execution.id,
            release_id: execution.release_id,
            release_number: execution.release_number.clone(),
            at: execution.created_at,
        });
        info!(
            execution_id = %execution.id,
            release_id = execution.release_id,
            release_number = %execution.release_number,
            units = plan.units.len(),
            members = plan.member_count(),
            "release execution created"
        );

        self.drive(execution, &guard, false).await
    }

    /// Apply a human decision to a gated member, then resume the drive.
    pub async fn decide(&self, decision: ApprovalDecision) -> Result<ReleaseExecution> {
        let guard = self.register(decision.execution_id)?;
        let mut execution = self.executions.get(decision.execution_id)?;
        gatekeeper::decide(self.sink.as_ref(), &mut execution, &decision)?;
        self.executions.save(&execution)?;
        self.drive(execution, &guard, true).await
    }

    /// Re-enter a persisted execution. Completed units are never dispatched
    /// again; terminal executions are returned unchanged.
    pub async fn resume(&self, id: Uuid) -> Result<ReleaseExecution> {
        let guard = self.register(id)?;
        let execution = self.executions.get(id)?;
        self.drive(execution, &guard, true).await
    }

    /// Stop an execution. Dispatched members receive the stop signal; members
    /// that never ran become `skipped`.
    pub fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = active.get(&id) {
                info!(execution_id = %id, "signalling active drive to cancel");
                handle.cancel();
                return Ok(CancelOutcome::Signalled);
            }
        }

        let _guard = self.register(id)?;
        let mut execution = self.executions.get(id)?;
        if execution.is_terminal() {
            return Err(RolloutError::InvalidTransition {
                from: execution.status.to_string(),
                to: ExecutionStatus::Cancelled.to_string(),
                reason: "release execution is already finished".into(),
            });
        }
        aggregator::cancel_execution(self.sink.as_ref(), &mut execution);
        self.executions.save(&execution)?;
        Ok(CancelOutcome::Finalized(execution))
    }

    pub fn status(&self, id: Uuid) -> Result<ReleaseExecution> {
        self.executions.get(id)
    }

    pub fn list(&self, release_id: u64) -> Result<Vec<ReleaseExecution>> {
        self.executions.list_for_release(release_id)
    }

    pub fn list_all(&self) -> Result<Vec<ReleaseExecution>> {
        self.executions.list_all()
    }

    // -----------------------------------------------------------------------
    // Drive loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        mut execution: ReleaseExecution,
        guard: &DriveGuard<'_>,
        resume: bool,
    ) -> Result<ReleaseExecution> {
        let sink = self.sink.as_ref();
        if execution.is_terminal() {
            debug!(execution_id = %execution.id, status = %execution.status, "nothing to drive");
            return Ok(execution);
        }
        if resume {
            self.recover(&mut execution)?;
        }
        aggregator::mark_started(sink, &mut execution);
        self.executions.save(&execution)?;
        let environments = self.environments_for(&execution)?;

        for unit_index in 0..execution.unit_count() {
            if guard.cancel.is_cancelled() {
                break;
            }

            let status = aggregator::unit_status(&execution, unit_index);
            if !matches!(status, UnitStatus::Succeeded | UnitStatus::Failed) {
                match gatekeeper::enter_unit(sink, &mut execution, unit_index, &environments) {
                    UnitReadiness::Held(_) => {
                        self.executions.save(&execution)?;
                        info!(execution_id = %execution.id, unit = unit_index, "drive paused at approval gate");
                        return Ok(execution);
                    }
                    UnitReadiness::Ready(ids) if !ids.is_empty() => {
                        self.run_unit(&mut execution, ids, guard).await?;
                    }
                    UnitReadiness::Ready(_) => {}
                }
                if guard.cancel.is_cancelled() {
                    break;
                }
            }

            let next = aggregator::fold_unit(sink, &mut execution, unit_index);
            self.executions.save(&execution)?;
            match next {
                Continuation::Advance => continue,
                Continuation::Pause => {
                    info!(execution_id = %execution.id, unit = unit_index, "drive paused at approval gate");
                    return Ok(execution);
                }
                Continuation::Halt | Continuation::Complete => return Ok(execution),
            }
        }

        if guard.cancel.is_cancelled() && !execution.is_terminal() {
            aggregator::cancel_execution(sink, &mut execution);
            self.executions.save(&execution)?;
        }
        Ok(execution)
    }

    /// Dispatch the ready members of one unit and wait for every one of them.
    /// Members cancelled before they got a dispatch slot stay `pending`.
    async fn run_unit(
        &self,
        execution: &mut ReleaseExecution,
        ids: Vec<Uuid>,
        guard: &DriveGuard<'_>,
    ) -> Result<()> {
        let sink = self.sink.as_ref();
        let execution_id = execution.id;

        // Members listen on a per-unit handle so sibling cancellation does not
        // cancel the whole execution.
        let unit_cancel = CancelHandle::new();
        // each member sends at most a start and an outcome
        let (tx, mut rx) = mpsc::channel(ids.len().max(1) * 2);
        for id in &ids {
            if let Some(stage) = execution.stage(*id) {
                let request = DispatchRequest::for_stage(execution, stage);
                self.executor.spawn(request, unit_cancel.signal(), tx.clone());
            }
        }
        drop(tx);

        let mut stop = guard.cancel.signal();
        let mut stopping = false;
        loop {
            tokio::select! {
                update = rx.recv() => {
                    let Some(update) = update else { break };
                    let outcome = match update {
                        MemberUpdate::Started { stage_execution_id, at } => {
                            if let Some(stage) = execution.stage_mut(stage_execution_id) {
                                self.executor.begin(sink, execution_id, stage, at);
                            }
                            execution.touch();
                            self.executions.save(execution)?;
                            continue;
                        }
                        MemberUpdate::Finished(outcome) => outcome,
                    };
                    let failed = !outcome.succeeded();
                    if let Some(stage) = execution.stage_mut(outcome.stage_execution_id) {
                        self.executor.finish(sink, execution_id, stage, outcome);
                    }
                    execution.touch();
                    self.executions.save(execution)?;

                    if failed
                        && self.config.sibling_failure == SiblingFailurePolicy::CancelSiblings
                        && !unit_cancel.is_cancelled()
                    {
                        info!(%execution_id, "member failed, cancelling siblings");
                        unit_cancel.cancel();
                    }
                }
                _ = stop.cancelled(), if !stopping => {
                    stopping = true;
                    info!(%execution_id, "cancellation requested, stopping dispatches");
                    unit_cancel.cancel();
                }
            }
        }

        // A dispatch task that died without reporting leaves its member in flight.
        let mut orphaned = false;
        for id in &ids {
            if let Some(stage) = execution.stage_mut(*id) {
                if stage.status == StageStatus::InProgress {
                    warn!(%execution_id, stage_execution_id = %stage.id, "dispatch ended without an outcome");
                    stage.error = Some("dispatch ended without reporting an outcome".into());
                    stage.completed_at = Some(Utc::now());
                    set_stage_status(sink, execution_id, stage, StageStatus::Failed);
                    orphaned = true;
                }
            }
        }
        if orphaned {
            self.executions.save(execution)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn environments_for(&self, execution: &ReleaseExecution) -> Result<HashMap<u64, Environment>> {
        let mut environments = HashMap::new();
        for stage in &execution.stages {
            if let Some(id) = stage.target.environment_id() {
                if !environments.contains_key(&id) {
                    let env = self.definitions.get_environment(execution.customer_id, id)?;
                    environments.insert(id, env);
                }
            }
        }
        Ok(environments)
    }

    /// Check a persisted execution before driving it again, then fail members
    /// that were in flight when the previous process stopped.
    fn recover(&self, execution: &mut ReleaseExecution) -> Result<()> {
        let id = execution.id;
        let inconsistent = |msg: String| RolloutError::ResumeInconsistency(format!("{id}: {msg}"));

        if execution.stages.is_empty() {
            return Err(inconsistent("execution has no stage executions".into()));
        }

        if execution.stages[0].unit_index != 0 {
            return Err(inconsistent("first unit index is not 0".into()));
        }
        for pair in execution.stages.windows(2) {
            let (prev, next) = (pair[0].unit_index, pair[1].unit_index);
            if next != prev && next != prev + 1 {
                return Err(inconsistent(format!(
                    "stage execution {} has unit index {next} after unit {prev}",
                    pair[1].id
                )));
            }
        }

        for stage in &execution.stages {
            if stage.status == StageStatus::AwaitingApproval
                && (stage.approval_gate.is_none()
                    || stage.approval_status != Some(ApprovalStatus::Pending))
            {
                return Err(inconsistent(format!(
                    "stage execution {} awaits approval without an open gate",
                    stage.id
                )));
            }
        }

        if execution.status == ExecutionStatus::Pending
            && execution.stages.iter().any(|s| s.status != StageStatus::Pending)
        {
            return Err(inconsistent(
                "pending execution has members that already progressed".into(),
            ));
        }

        // Units after the first unfinished one must be untouched.
        let unit_count = execution.unit_count();
        let first_open = (0..unit_count)
            .find(|&i| aggregator::unit_status(&*execution, i) != UnitStatus::Succeeded)
            .unwrap_or(unit_count);
        if let Some(stage) = execution.stages.iter().find(|s| {
            s.unit_index > first_open
                && (s.status != StageStatus::Pending || s.approval_status.is_some())
        }) {
            return Err(inconsistent(format!(
                "stage execution {} in unit {} progressed before unit {first_open} finished",
                stage.id, stage.unit_index
            )));
        }

        let sink = self.sink.as_ref();
        let now = Utc::now();
        for stage in execution.stages.iter_mut() {
            if stage.status == StageStatus::InProgress {
                warn!(execution_id = %id, stage_execution_id = %stage.id, "member interrupted before completion");
                stage.error = Some("interrupted before completion".into());
                stage.completed_at = Some(now);
                set_stage_status(sink, id, stage, StageStatus::Failed);
            }
        }
        Ok(())
    }
}
