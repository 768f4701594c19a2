use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::gateway::types::ExecutionReport;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Salesforce API error: {0}")]
    Salesforce(String),

    #[error("Salesforce record not found: {0}")]
    SalesforceNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// How the workflow manager reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Configuration or data-contract error. Never retried.
    Contract,
    /// Provider or gateway hiccup. Retried up to the configured bound.
    Transient,
    /// The execution gateway applied part of a plan. Surfaced verbatim, never retried.
    ExternalApply,
    /// The run was cancelled while the work was in flight.
    Cancelled,
}

/// Why a stage, crew member, or run failed.
///
/// Serializable so a failed run's checkpoint still explains what went wrong
/// after a restart.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("invalid input for agent '{agent}': {reason}")]
    InvalidInput { agent: String, reason: String },

    #[error("agent '{agent}' returned output violating its schema: {reason}")]
    SchemaViolation { agent: String, reason: String },

    #[error("dependency cycle in crew '{crew}' involving '{member}'")]
    DependencyCycle { crew: String, member: String },

    #[error("'{scope}' is misconfigured: {reason}")]
    Misconfigured { scope: String, reason: String },

    #[error("artifact '{key}' already exists in the workflow context")]
    ArtifactCollision { key: String },

    #[error("stage '{stage}' does not accept partial failure (failed agents: {})", .failed_agents.join(", "))]
    PartialFailureRejected {
        stage: String,
        failed_agents: Vec<String>,
    },

    #[error("agent '{agent}' not run because dependency '{dependency}' failed: {upstream}")]
    DependencyFailed {
        agent: String,
        dependency: String,
        upstream: Box<FailureCause>,
    },

    #[error("provider unavailable for agent '{agent}': {reason}")]
    ProviderUnavailable { agent: String, reason: String },

    #[error("provider rate limited agent '{agent}': {reason}")]
    RateLimited { agent: String, reason: String },

    #[error("account '{account_id}' not found")]
    AccountNotFound { account_id: String },

    #[error("account data gateway unavailable: {reason}")]
    GatewayUnavailable { reason: String },

    #[error("action plan partially applied: {}", .report.failure_summary())]
    PartialApply { report: ExecutionReport },

    #[error("applying action plan {plan_id} was interrupted; which of its {steps} steps ran is unknown")]
    ApplyInterrupted { plan_id: Uuid, steps: usize },

    #[error("run cancelled: {reason}")]
    Cancelled { reason: String },
}

impl FailureCause {
    pub fn class(&self) -> ErrorClass {
        match self {
            FailureCause::ProviderUnavailable { .. }
            | FailureCause::RateLimited { .. }
            | FailureCause::GatewayUnavailable { .. } => ErrorClass::Transient,
            FailureCause::DependencyFailed { upstream, .. } => upstream.class(),
            FailureCause::PartialApply { .. } | FailureCause::ApplyInterrupted { .. } => {
                ErrorClass::ExternalApply
            }
            FailureCause::Cancelled { .. } => ErrorClass::Cancelled,
            _ => ErrorClass::Contract,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Failure reported by a capability provider.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rate limited: {0}")]
    RateLimited(String),
}

/// Failure reported by the account data gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("account '{0}' not found")]
    NotFound(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by the execution gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error("plan partially applied: {}", .report.failure_summary())]
    PartialApplyFailure { report: ExecutionReport },
}

impl ApplyError {
    pub fn report(&self) -> &ExecutionReport {
        match self {
            ApplyError::PartialApplyFailure { report } => report,
        }
    }
}

/// Rejected mutation of a workflow context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("artifact '{0}' already exists")]
    KeyCollision(String),

    #[error("workflow context is sealed")]
    Sealed,
}
