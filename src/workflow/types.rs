use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentOutput;
use crate::error::FailureCause;
use crate::gateway::types::ExecutionReport;
use crate::workflow::context::ContextSummary;

/// Position of a run in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    FetchingData,
    RunningStage { index: usize, name: String },
    /// Suspended until a recommendation is selected for stage `next_stage`.
    AwaitingUserInput { next_stage: usize },
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => f.write_str("PENDING"),
            RunState::FetchingData => f.write_str("FETCHING_DATA"),
            RunState::RunningStage { index, name } => write!(f, "RUNNING_STAGE({index}:{name})"),
            RunState::AwaitingUserInput { .. } => f.write_str("AWAITING_USER_INPUT"),
            RunState::Completed => f.write_str("COMPLETED"),
            RunState::Failed => f.write_str("FAILED"),
            RunState::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

/// What a crew produced for one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success {
        outputs: Vec<AgentOutput>,
    },
    PartialFailure {
        outputs: Vec<AgentOutput>,
        failed_agents: Vec<(String, FailureCause)>,
    },
    Fatal {
        error: FailureCause,
    },
}

impl StageResult {
    pub fn outputs(&self) -> &[AgentOutput] {
        match self {
            StageResult::Success { outputs } | StageResult::PartialFailure { outputs, .. } => {
                outputs
            }
            StageResult::Fatal { .. } => &[],
        }
    }

    pub fn failed_agent_ids(&self) -> Vec<String> {
        match self {
            StageResult::PartialFailure { failed_agents, .. } => {
                failed_agents.iter().map(|(id, _)| id.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    DataFetched,
    StageCompleted {
        stage: String,
        index: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_optional: Vec<String>,
    },
    AwaitingUserInput {
        stage: String,
        recommendations: Vec<Recommendation>,
    },
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        report: Option<ExecutionReport>,
    },
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        cause: FailureCause,
    },
    Cancelled,
}

/// A ranked candidate action produced by a strategy stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub rationale: String,
    pub confidence_score: f64,
    /// Keys of the context artifacts this recommendation was derived from.
    pub source_artifacts: Vec<String>,
}

/// Caller-held reference to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub run_id: Uuid,
}

/// Point-in-time view of a run for callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub account_id: String,
    #[serde(flatten)]
    pub state: RunState,
    pub context: ContextSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<Recommendation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<StageOutcome>,
    pub updated_at: DateTime<Utc>,
}

/// Pushed to subscribers on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub run_id: Uuid,
    pub state: RunState,
    pub at: DateTime<Utc>,
}
