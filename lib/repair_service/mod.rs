mod error;
mod orchestrator;
mod stop;
mod types;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use tracing::info;

pub use error::Error;
pub use orchestrator::{default_progress_key, RepairOrchestrator, RepairOrchestratorConfig};
pub use stop::StopSignal;
pub use types::{FragmentOutcome, PassOutcome, RepairResult, RunSummary};

use crate::executor::RepairExecutor;
use crate::store::ProgressStore;
use crate::topology::Topology;

/// Runs the repair loop on its own task and waits for it to unwind after a stop.
pub async fn run_repair_worker<T, E, S>(
    orchestrator: Arc<RepairOrchestrator<T, E, S>>,
) -> Result<RunSummary, Error>
where
    T: Topology + 'static,
    E: RepairExecutor + 'static,
    S: ProgressStore + 'static,
{
    info!(
        event = "repair_worker_spawned",
        cluster = %orchestrator.config().cluster,
        keyspaces = ?orchestrator.config().keyspaces,
        progress_key = %orchestrator.config().progress_key,
        "starting repair loop"
    );
    let handle = tokio::spawn(async move { orchestrator.run().await });
    Ok(handle.await?)
}
