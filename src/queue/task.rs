use uuid::Uuid;

use crate::workflow::WorkflowHandle;

/// Background work for the queue processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Advance a run until it waits for input or finishes.
    Drive { run_id: Uuid },
}

impl Task {
    pub fn drive(handle: WorkflowHandle) -> Self {
        Task::Drive {
            run_id: handle.run_id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Task::Drive { run_id } => format!("Drive run {run_id}"),
        }
    }
}
