pub mod checkpoint;
pub mod context;
pub mod manager;
pub mod nba;
pub mod retry;
pub mod stage;
pub mod types;

pub use manager::WorkflowManager;
pub use types::{RunState, RunStatus, StageOutcome, WorkflowHandle};
