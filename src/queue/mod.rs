pub mod startup;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::workflow::{WorkflowHandle, WorkflowManager};

use task::Task;

/// Sending half of the run queue, cheap to clone into handlers.
#[derive(Clone)]
pub struct RunQueue {
    tx: UnboundedSender<Task>,
}

impl RunQueue {
    pub fn new() -> (Self, UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, task: Task) {
        tracing::info!(task = %task.description(), "Enqueuing task");
        if self.tx.send(task).is_err() {
            tracing::warn!(task = %task.description(), "Queue processor is gone, task dropped");
        }
    }
}

/// Run the background queue processor.
///
/// Each task gets its own driver so independent runs proceed concurrently.
pub async fn run_queue_processor(manager: Arc<WorkflowManager>, mut rx: UnboundedReceiver<Task>) {
    tracing::info!("Queue processor started");

    while let Some(task) = rx.recv().await {
        tracing::info!(task = %task.description(), "Processing task");
        let manager = Arc::clone(&manager);

        tokio::spawn(async move {
            match task {
                Task::Drive { run_id } => {
                    match manager.drive(WorkflowHandle { run_id }).await {
                        Ok(outcome) => {
                            tracing::info!(
                                task = %task.description(),
                                outcome = ?outcome,
                                "Task completed"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                task = %task.description(),
                                error = %e,
                                "Task failed"
                            );
                        }
                    }
                }
            }
        });
    }

    tracing::info!("Queue processor stopped");
}

/// Periodically expire runs left waiting for input and old finished runs.
pub async fn run_sweeper(manager: Arc<WorkflowManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let (cancelled, dropped) = manager.expire_stale().await;
        tracing::debug!(cancelled, dropped, "Sweep finished");
    }
}
