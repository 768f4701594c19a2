use std::sync::Arc;

use crate::queue::task::Task;
use crate::queue::RunQueue;
use crate::workflow::WorkflowManager;

/// Reload checkpointed runs and enqueue the ones that can make progress.
///
/// Runs waiting for a selection are restored but stay parked until the
/// selection arrives.
pub async fn resume_runs(manager: &Arc<WorkflowManager>, queue: &RunQueue) {
    tracing::info!("Restoring runs from checkpoints...");

    let handles = match manager.resume_persisted().await {
        Ok(handles) => handles,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load checkpoints on startup");
            return;
        }
    };

    for handle in &handles {
        queue.enqueue(Task::drive(*handle));
    }

    tracing::info!(resumed = handles.len(), "Startup resume complete");
}
