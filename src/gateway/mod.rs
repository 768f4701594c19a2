pub mod salesforce;
pub mod types;

use async_trait::async_trait;

use crate::error::{ApplyError, GatewayError};
use types::*;

/// Source of normalized account data.
#[async_trait]
pub trait AccountDataGateway: Send + Sync {
    async fn fetch_account(&self, account_id: &str) -> Result<AccountData, GatewayError>;
}

/// Applies an approved action plan to Salesforce.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Apply every step in order. Steps already applied when a later one fails
    /// are not rolled back; the error's report lists them.
    async fn apply(&self, plan: &ActionPlan) -> Result<ExecutionReport, ApplyError>;
}

/// Applies a single action step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Returns the id of the created or updated record, when there is one.
    async fn execute_step(
        &self,
        account_id: &str,
        step: &ActionStep,
    ) -> crate::error::Result<Option<String>>;
}

/// Apply `plan` one step at a time, stopping at the first failure.
pub async fn apply_plan(
    executor: &dyn StepExecutor,
    plan: &ActionPlan,
) -> Result<ExecutionReport, ApplyError> {
    let mut completed = Vec::with_capacity(plan.steps.len());

    for (index, step) in plan.steps.iter().enumerate() {
        let position = index + 1;
        match executor.execute_step(&plan.account_id, step).await {
            Ok(record_id) => {
                tracing::info!(
                    plan_id = %plan.id,
                    step = position,
                    operation = %step.operation,
                    record_id = ?record_id,
                    "Action step applied"
                );
                completed.push(CompletedStep {
                    step: position,
                    operation: step.operation,
                    record_id,
                });
            }
            Err(e) => {
                tracing::error!(
                    plan_id = %plan.id,
                    step = position,
                    operation = %step.operation,
                    error = %e,
                    "Action step failed"
                );
                let report = ExecutionReport {
                    plan_id: plan.id,
                    total_steps: plan.steps.len(),
                    completed,
                    failed: Some(FailedStep {
                        step: position,
                        operation: step.operation,
                        cause: e.to_string(),
                    }),
                    not_attempted: (position + 1..=plan.steps.len()).collect(),
                    finished_at: chrono::Utc::now(),
                };
                return Err(ApplyError::PartialApplyFailure { report });
            }
        }
    }

    Ok(ExecutionReport {
        plan_id: plan.id,
        total_steps: plan.steps.len(),
        completed,
        failed: None,
        not_attempted: Vec::new(),
        finished_at: chrono::Utc::now(),
    })
}
