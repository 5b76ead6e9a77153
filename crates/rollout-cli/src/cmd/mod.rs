pub mod approval;
pub mod deploy;
pub mod execution;
pub mod init;
pub mod plan;
pub mod validate;

use crate::dispatch::ShellDispatcher;
use crate::output::{print_execution, print_json};
use anyhow::Context;
use rollout_core::config::Config;
use rollout_core::db::ExecutionDb;
use rollout_core::execution::ReleaseExecution;
use rollout_core::progress::TracingSink;
use rollout_core::store::DefinitionCatalog;
use rollout_core::types::ExecutionStatus;
use rollout_core::{paths, Orchestrator};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Wire the orchestrator to the on-disk definitions, the execution db and the
/// shell dispatcher.
pub fn orchestrator(root: &Path) -> anyhow::Result<Orchestrator> {
    let config = Config::load(root).context("failed to load config")?;
    let catalog = DefinitionCatalog::load(root).context("failed to load definitions")?;
    let db_path = paths::executions_db_path(root);
    let db = ExecutionDb::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let dispatcher = ShellDispatcher::new(root.to_path_buf(), config.dispatch.clone());

    Ok(Orchestrator::new(
        Arc::new(catalog),
        Arc::new(db),
        Arc::new(dispatcher),
        Arc::new(TracingSink),
        config.orchestrator,
    ))
}

/// Run a driving operation to completion. On Ctrl-C every drive in this
/// process is cancelled and the operation is awaited until the execution is
/// finalized as `cancelled`.
pub fn drive<F: Future>(orch: &Orchestrator, future: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Runtime::new()?;
    Ok(rt.block_on(async {
        tokio::pin!(future);
        // the handler is registered before the drive dispatches anything
        tokio::select! {
            biased;
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        warn!("interrupted, cancelling release execution");
                        orch.interrupt();
                    }
                    Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
                }
                future.await
            }
            out = &mut future => out,
        }
    }))
}

/// Print an execution returned by a driving command. A failed or cancelled
/// execution makes the command fail after printing.
pub fn report(execution: &ReleaseExecution, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(execution)?;
    } else {
        print_execution(execution);
    }
    if execution.status == ExecutionStatus::Cancelled {
        anyhow::bail!("release execution {} was cancelled", execution.id);
    }
    if execution.status == ExecutionStatus::Failed {
        anyhow::bail!(
            "release execution {} failed{}",
            execution.id,
            execution
                .error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
