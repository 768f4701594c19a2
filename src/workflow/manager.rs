use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::error::{AppError, ApplyError, ContextError, FailureCause, GatewayError, Result};
use crate::gateway::types::{ActionPlan, ExecutionReport};
use crate::gateway::{AccountDataGateway, ExecutionGateway};
use crate::workflow::checkpoint::CheckpointStore;
use crate::workflow::context::{
    stage_key, Artifact, WorkflowContext, ACCOUNT_DATA_KEY, SELECTED_RECOMMENDATION_KEY,
};
use crate::workflow::nba;
use crate::workflow::retry::{retry, RetryPolicy};
use crate::workflow::stage::{EmitSpec, Stage, StageRegistry};
use crate::workflow::types::{
    Recommendation, RunState, RunStatus, StageOutcome, StageResult, StatusEvent, WorkflowHandle,
};

const EVENT_CAPACITY: usize = 256;
const RECOMMENDATIONS: &str = "recommendations";
const ACTION_PLAN: &str = "actionPlan";
const EXECUTION_REPORT: &str = "executionReport";

/// Everything persisted about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub context: WorkflowContext,
    #[serde(default)]
    pub history: Vec<StageOutcome>,
    #[serde(default)]
    pub last_outcome: Option<StageOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: Uuid, account_id: &str) -> Self {
        let now = Utc::now();
        Self {
            context: WorkflowContext::new(run_id, account_id),
            history: Vec::new(),
            last_outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> &RunState {
        self.context.state()
    }

    /// Recommendations from the most recent stage that emitted any.
    pub fn latest_recommendations(&self) -> Option<Vec<Recommendation>> {
        let suffix = format!(".{RECOMMENDATIONS}");
        let keys: Vec<&str> = self.context.keys().collect();
        keys.into_iter()
            .rev()
            .find(|k| k.ends_with(&suffix))
            .and_then(|k| self.context.value(k))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn status(&self) -> RunStatus {
        let recommendations = match self.state() {
            RunState::AwaitingUserInput { .. } => self.latest_recommendations(),
            _ => None,
        };
        RunStatus {
            run_id: self.context.run_id(),
            account_id: self.context.account_id().to_string(),
            state: self.state().clone(),
            context: self.context.summary(),
            recommendations,
            last_outcome: self.last_outcome.clone(),
            updated_at: self.updated_at,
        }
    }
}

struct RunEntry {
    run: Mutex<Run>,
    cancel: CancellationToken,
    /// Copy of the run's status, readable while a stage holds `run`.
    status: RwLock<RunStatus>,
}

impl RunEntry {
    fn new(run: Run) -> Self {
        let status = run.status();
        Self {
            run: Mutex::new(run),
            cancel: CancellationToken::new(),
            status: RwLock::new(status),
        }
    }
}

/// Drives runs through the stage pipeline, one `advance` at a time.
pub struct WorkflowManager {
    stages: Arc<StageRegistry>,
    accounts: Arc<dyn AccountDataGateway>,
    executor: Arc<dyn ExecutionGateway>,
    checkpoints: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    config: WorkflowConfig,
    runs: RwLock<HashMap<Uuid, Arc<RunEntry>>>,
    events: broadcast::Sender<StatusEvent>,
}

impl WorkflowManager {
    pub fn new(
        stages: Arc<StageRegistry>,
        accounts: Arc<dyn AccountDataGateway>,
        executor: Arc<dyn ExecutionGateway>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: WorkflowConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            stages,
            accounts,
            executor,
            checkpoints,
            retry: RetryPolicy::from_config(&config),
            config,
            runs: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Push channel of state transitions across all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    async fn entry(&self, handle: WorkflowHandle) -> Result<Arc<RunEntry>> {
        self.runs
            .read()
            .await
            .get(&handle.run_id)
            .cloned()
            .ok_or(AppError::RunNotFound(handle.run_id))
    }

    pub async fn start(&self, account_id: &str) -> Result<WorkflowHandle> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return Err(AppError::InvalidRequest(
                "account id must not be empty".to_string(),
            ));
        }

        let run_id = Uuid::new_v4();
        let run = Run::new(run_id, account_id);
        self.save(&run).await;
        self.publish(&run);
        self.runs
            .write()
            .await
            .insert(run_id, Arc::new(RunEntry::new(run)));

        tracing::info!(run_id = %run_id, account_id, "Run started");
        Ok(WorkflowHandle { run_id })
    }

    pub async fn status(&self, handle: WorkflowHandle) -> Result<RunStatus> {
        let entry = self.entry(handle).await?;
        let status = entry.status.read().await.clone();
        Ok(status)
    }

    /// Full context of a run, for diagnostics.
    pub async fn context(&self, handle: WorkflowHandle) -> Result<WorkflowContext> {
        let entry = self.entry(handle).await?;
        let run = entry.run.lock().await;
        Ok(run.context.clone())
    }

    /// Take the run one step forward.
    ///
    /// Terminal and suspended runs are left untouched and report the outcome
    /// that put them there.
    pub async fn advance(&self, handle: WorkflowHandle) -> Result<StageOutcome> {
        let entry = self.entry(handle).await?;
        let mut run = entry.run.lock().await;

        let state = run.state().clone();
        if !state.is_terminal() && entry.cancel.is_cancelled() {
            return Ok(self.finalize_cancelled(&entry, &mut run).await);
        }
        if state.is_terminal() || matches!(state, RunState::AwaitingUserInput { .. }) {
            return run.last_outcome.clone().ok_or_else(|| {
                AppError::Internal(format!("run {} in {state} has no outcome", handle.run_id))
            });
        }

        match state {
            RunState::Pending | RunState::FetchingData => self.fetch_account(&entry, &mut run).await,
            RunState::RunningStage { index, .. } => self.run_stage(&entry, &mut run, index).await,
            _ => Err(AppError::Internal(format!("unexpected state {state}"))),
        }
    }

    /// Advance until the run is suspended or finished.
    pub async fn drive(&self, handle: WorkflowHandle) -> Result<StageOutcome> {
        loop {
            let outcome = self.advance(handle).await?;
            let state = self.status(handle).await?.state;
            if state.is_terminal() || matches!(state, RunState::AwaitingUserInput { .. }) {
                return Ok(outcome);
            }
        }
    }

    /// Stop scheduling work for a run.
    ///
    /// An idle run is finalized at once; a run with a stage in flight is
    /// finalized by that stage's `advance` once its agents return.
    pub async fn cancel(&self, handle: WorkflowHandle) -> Result<()> {
        let entry = self.entry(handle).await?;
        let state = entry.status.read().await.state.clone();
        if state.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "run {} is already {state}",
                handle.run_id
            )));
        }

        entry.cancel.cancel();
        tracing::info!(run_id = %handle.run_id, state = %state, "Cancellation requested");

        // Only a stage in flight holds the lock for long; idle runs are worth waiting for.
        let run = if is_idle(&state) {
            Some(entry.run.lock().await)
        } else {
            entry.run.try_lock().ok()
        };
        if let Some(mut run) = run {
            if !run.state().is_terminal() {
                self.finalize_cancelled(&entry, &mut run).await;
            }
        }
        Ok(())
    }

    pub async fn select_recommendation(
        &self,
        handle: WorkflowHandle,
        recommendation_id: &str,
    ) -> Result<()> {
        let entry = self.entry(handle).await?;
        let state = entry.status.read().await.state.clone();
        if !matches!(state, RunState::AwaitingUserInput { .. }) {
            return Err(AppError::InvalidState(format!(
                "run {} is {state}, not awaiting input",
                handle.run_id
            )));
        }
        let mut run = entry.run.lock().await;

        let next_stage = match run.state() {
            RunState::AwaitingUserInput { next_stage } if !entry.cancel.is_cancelled() => {
                *next_stage
            }
            other => {
                return Err(AppError::InvalidState(format!(
                    "run {} is {other}, not awaiting input",
                    handle.run_id
                )));
            }
        };

        let recommendation = run
            .latest_recommendations()
            .unwrap_or_default()
            .into_iter()
            .find(|r| r.id == recommendation_id)
            .ok_or_else(|| {
                AppError::InvalidRequest(format!("unknown recommendation '{recommendation_id}'"))
            })?;

        let stage = self.stage(next_stage)?;
        run.context
            .insert(
                SELECTED_RECOMMENDATION_KEY,
                Artifact::new(serde_json::to_value(&recommendation)?, "user"),
            )
            .map_err(|e| AppError::InvalidState(e.to_string()))?;

        tracing::info!(
            run_id = %handle.run_id,
            recommendation = %recommendation.id,
            "Recommendation selected"
        );
        self.transition(
            &entry,
            &mut run,
            RunState::RunningStage {
                index: next_stage,
                name: stage.name().to_string(),
            },
            next_stage,
            None,
        )
        .await;
        Ok(())
    }

    /// Forget a finished run and its checkpoint.
    pub async fn discard(&self, handle: WorkflowHandle) -> Result<()> {
        let entry = self.entry(handle).await?;
        let state = entry.status.read().await.state.clone();
        if !state.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "run {} is {state}; only finished runs can be discarded",
                handle.run_id
            )));
        }

        self.runs.write().await.remove(&handle.run_id);
        self.checkpoints.remove(handle.run_id).await?;
        tracing::info!(run_id = %handle.run_id, "Run discarded");
        Ok(())
    }

    /// Reload checkpointed runs. Returns the runs that can make progress.
    pub async fn resume_persisted(&self) -> Result<Vec<WorkflowHandle>> {
        let persisted = self.checkpoints.load_all().await?;
        let mut runs = self.runs.write().await;
        let mut resumable = Vec::new();
        let mut interrupted = Vec::new();

        for mut run in persisted {
            let run_id = run.context.run_id();
            if runs.contains_key(&run_id) {
                continue;
            }
            // The fetch is not recorded until it succeeds, so start it over.
            if matches!(run.state(), RunState::FetchingData) {
                run.context.set_position(RunState::Pending, 0);
            }
            let stopped = interrupted_apply(&run);
            if stopped.is_none()
                && matches!(run.state(), RunState::Pending | RunState::RunningStage { .. })
            {
                resumable.push(WorkflowHandle { run_id });
            }
            tracing::info!(run_id = %run_id, state = %run.state(), "Run restored from checkpoint");
            let entry = Arc::new(RunEntry::new(run));
            runs.insert(run_id, Arc::clone(&entry));
            if let Some(stopped) = stopped {
                interrupted.push((entry, stopped));
            }
        }
        drop(runs);

        // Never re-apply a plan: some of its writes may already be in the org.
        for (entry, (stage, cause)) in interrupted {
            let mut run = entry.run.lock().await;
            self.fail(&entry, &mut run, Some(stage), cause).await;
        }

        Ok(resumable)
    }

    /// Cancel runs left waiting too long and drop expired finished runs.
    ///
    /// Returns how many runs were cancelled and how many were dropped.
    pub async fn expire_stale(&self) -> (usize, usize) {
        let now = Utc::now();
        let awaiting_ttl = self
            .config
            .awaiting_input_ttl_secs
            .map(|s| chrono::Duration::seconds(s as i64));
        let retention = self
            .config
            .terminal_retention_secs
            .map(|s| chrono::Duration::seconds(s as i64));

        let entries: Vec<(Uuid, Arc<RunEntry>)> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, Arc::clone(e)))
            .collect();

        let mut cancelled = 0;
        let mut dropped = 0;
        for (run_id, entry) in entries {
            let (state, updated_at) = {
                let status = entry.status.read().await;
                (status.state.clone(), status.updated_at)
            };
            let age = now - updated_at;

            match state {
                RunState::AwaitingUserInput { .. } if awaiting_ttl.is_some_and(|ttl| age >= ttl) => {
                    tracing::info!(run_id = %run_id, "Selection window expired");
                    if self.cancel(WorkflowHandle { run_id }).await.is_ok() {
                        cancelled += 1;
                    }
                }
                s if s.is_terminal() && retention.is_some_and(|ttl| age >= ttl) => {
                    if self.discard(WorkflowHandle { run_id }).await.is_ok() {
                        dropped += 1;
                    }
                }
                s if !s.is_terminal() && entry.cancel.is_cancelled() => {
                    // Cancelled while busy and never advanced again.
                    if let Ok(mut run) = entry.run.try_lock() {
                        if !run.state().is_terminal() {
                            self.finalize_cancelled(&entry, &mut run).await;
                        }
                    }
                }
                _ => {}
            }
        }

        if cancelled + dropped > 0 {
            tracing::info!(cancelled, dropped, "Expired stale runs");
        }
        (cancelled, dropped)
    }

    /// Save every idle run. Busy runs were saved at their last transition.
    pub async fn checkpoint_all(&self) -> usize {
        let entries: Vec<Arc<RunEntry>> = self.runs.read().await.values().cloned().collect();
        let mut saved = 0;
        for entry in entries {
            match entry.run.try_lock() {
                Ok(run) => {
                    self.save(&run).await;
                    saved += 1;
                }
                Err(_) => {
                    let status = entry.status.read().await;
                    tracing::warn!(run_id = %status.run_id, state = %status.state, "Run busy at shutdown");
                }
            }
        }
        saved
    }

    fn stage(&self, index: usize) -> Result<Arc<Stage>> {
        self.stages
            .stage(index)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("no stage at index {index}")))
    }

    async fn fetch_account(&self, entry: &RunEntry, run: &mut Run) -> Result<StageOutcome> {
        let run_id = run.context.run_id();
        let account_id = run.context.account_id().to_string();
        self.transition(entry, run, RunState::FetchingData, 0, None).await;

        let accounts = Arc::clone(&self.accounts);
        let fetched = retry(&self.retry, &entry.cancel, "account fetch", |_| {
            let accounts = Arc::clone(&accounts);
            let account_id = account_id.clone();
            async move {
                accounts
                    .fetch_account(&account_id)
                    .await
                    .map_err(|e| match e {
                        GatewayError::NotFound(account_id) => {
                            FailureCause::AccountNotFound { account_id }
                        }
                        GatewayError::Unavailable(reason) => {
                            FailureCause::GatewayUnavailable { reason }
                        }
                    })
            }
        })
        .await;

        if entry.cancel.is_cancelled() {
            return Ok(self.finalize_cancelled(entry, run).await);
        }
        let account = match fetched {
            Ok(account) => account,
            Err(cause) => return Ok(self.fail(entry, run, None, cause).await),
        };

        tracing::info!(
            run_id = %run_id,
            account = %account.name,
            contacts = account.contacts.len(),
            opportunities = account.opportunities.len(),
            "Account data fetched"
        );
        let value = serde_json::to_value(&account)?;
        if let Err(e) = run
            .context
            .insert(ACCOUNT_DATA_KEY, Artifact::new(value, "account_gateway"))
        {
            return self.reject_merge(entry, run, None, e).await;
        }

        let first = self.stage(0)?;
        self.transition(
            entry,
            run,
            RunState::RunningStage {
                index: 0,
                name: first.name().to_string(),
            },
            0,
            Some(StageOutcome::DataFetched),
        )
        .await;
        Ok(StageOutcome::DataFetched)
    }

    async fn run_stage(
        &self,
        entry: &RunEntry,
        run: &mut Run,
        index: usize,
    ) -> Result<StageOutcome> {
        let stage = self.stage(index)?;
        let run_id = run.context.run_id();
        let name = stage.name().to_string();

        if let Some((stage, cause)) = interrupted_apply(run) {
            return Ok(self.fail(entry, run, Some(stage), cause).await);
        }

        let context = &run.context;
        let cancel = &entry.cancel;
        let attempted = retry(&self.retry, cancel, &name, |attempt| {
            let stage = Arc::clone(&stage);
            async move {
                if attempt > 1 {
                    tracing::info!(run_id = %run_id, stage = %stage.name(), attempt, "Retrying stage");
                }
                match stage.execute(context, cancel).await {
                    StageResult::Fatal { error } => Err(error),
                    other => Ok(other),
                }
            }
        })
        .await;

        // Results of a stage that finished after cancellation are dropped.
        if entry.cancel.is_cancelled() {
            return Ok(self.finalize_cancelled(entry, run).await);
        }
        let result = match attempted {
            Ok(result) => result,
            Err(cause) => return Ok(self.fail(entry, run, Some(name), cause).await),
        };

        let failed_optional = result.failed_agent_ids();
        if !failed_optional.is_empty() && !stage.continue_on_partial() {
            let cause = FailureCause::PartialFailureRejected {
                stage: name.clone(),
                failed_agents: failed_optional,
            };
            return Ok(self.fail(entry, run, Some(name), cause).await);
        }
        if !failed_optional.is_empty() {
            tracing::warn!(
                run_id = %run_id,
                stage = %name,
                failed = ?failed_optional,
                "Stage continued without optional members"
            );
        }

        let mut artifacts: Vec<(String, Artifact)> = result
            .outputs()
            .iter()
            .map(|output| {
                (
                    stage_key(&name, &output.agent_id),
                    Artifact::new(output.payload.clone(), &output.agent_id)
                        .with_confidence(output.confidence),
                )
            })
            .collect();

        let mut plan = None;
        if let Err(cause) = self.derive(&stage, run, &result, &mut artifacts, &mut plan) {
            return Ok(self.fail(entry, run, Some(name), cause).await);
        }
        if let Err(e) = run.context.merge(artifacts) {
            return self.reject_merge(entry, run, Some(name), e).await;
        }

        let mut report = None;
        if let Some(plan) = plan {
            // A checkpoint holding the plan without its report marks an apply in progress.
            self.save(run).await;
            tracing::info!(run_id = %run_id, plan_id = %plan.id, steps = plan.steps.len(), "Applying action plan");
            match self.executor.apply(&plan).await {
                Ok(applied) => {
                    self.record_report(run, &name, &applied)?;
                    report = Some(applied);
                }
                Err(ApplyError::PartialApplyFailure { report }) => {
                    self.record_report(run, &name, &report)?;
                    let cause = FailureCause::PartialApply { report };
                    return Ok(self.fail(entry, run, Some(name), cause).await);
                }
            }
        }

        tracing::info!(run_id = %run_id, stage = %name, index, "Stage completed");
        let completed = StageOutcome::StageCompleted {
            stage: name.clone(),
            index,
            failed_optional,
        };

        let next = index + 1;
        let Some(next_stage) = self.stages.stage(next) else {
            run.history.push(completed);
            let outcome = StageOutcome::Completed { report };
            self.transition(entry, run, RunState::Completed, index, Some(outcome.clone()))
                .await;
            return Ok(outcome);
        };

        if next_stage.requires_selection() {
            run.history.push(completed);
            let outcome = StageOutcome::AwaitingUserInput {
                stage: name,
                recommendations: run.latest_recommendations().unwrap_or_default(),
            };
            self.transition(
                entry,
                run,
                RunState::AwaitingUserInput { next_stage: next },
                next,
                Some(outcome.clone()),
            )
            .await;
            return Ok(outcome);
        }

        self.transition(
            entry,
            run,
            RunState::RunningStage {
                index: next,
                name: next_stage.name().to_string(),
            },
            next,
            Some(completed.clone()),
        )
        .await;
        Ok(completed)
    }

    /// Add the stage's derived artifact, if it declares one.
    fn derive(
        &self,
        stage: &Stage,
        run: &Run,
        result: &StageResult,
        artifacts: &mut Vec<(String, Artifact)>,
        plan: &mut Option<ActionPlan>,
    ) -> std::result::Result<(), FailureCause> {
        let from_agent = match stage.emits() {
            EmitSpec::Artifacts => return Ok(()),
            EmitSpec::Recommendations { from_agent } | EmitSpec::ActionPlan { from_agent } => {
                from_agent
            }
        };
        let payload = result
            .outputs()
            .iter()
            .find(|o| &o.agent_id == from_agent)
            .map(|o| &o.payload)
            .ok_or_else(|| FailureCause::Misconfigured {
                scope: stage.name().to_string(),
                reason: format!("agent '{from_agent}' produced no output to derive from"),
            })?;

        match stage.emits() {
            EmitSpec::Recommendations { .. } => {
                let sources = stage.source_keys(&run.context);
                let recommendations = nba::parse_recommendations(from_agent, payload, &sources)?;
                let value = serde_json::to_value(&recommendations).map_err(|e| {
                    FailureCause::SchemaViolation {
                        agent: from_agent.clone(),
                        reason: e.to_string(),
                    }
                })?;
                artifacts.push((
                    stage_key(stage.name(), RECOMMENDATIONS),
                    Artifact::new(value, stage.name()),
                ));
            }
            EmitSpec::ActionPlan { .. } => {
                let recommendation_id = run
                    .context
                    .value(SELECTED_RECOMMENDATION_KEY)
                    .and_then(|v| v.get("id"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                let action_plan = nba::parse_action_plan(
                    from_agent,
                    payload,
                    run.context.account_id(),
                    recommendation_id,
                )?;
                let value = serde_json::to_value(&action_plan).map_err(|e| {
                    FailureCause::SchemaViolation {
                        agent: from_agent.clone(),
                        reason: e.to_string(),
                    }
                })?;
                artifacts.push((
                    stage_key(stage.name(), ACTION_PLAN),
                    Artifact::new(value, stage.name()),
                ));
                *plan = Some(action_plan);
            }
            EmitSpec::Artifacts => {}
        }
        Ok(())
    }

    fn record_report(&self, run: &mut Run, stage: &str, report: &ExecutionReport) -> Result<()> {
        let value = serde_json::to_value(report)?;
        run.context
            .insert(
                &stage_key(stage, EXECUTION_REPORT),
                Artifact::new(value, "execution_gateway"),
            )
            .map_err(|e| AppError::InvalidState(e.to_string()))
    }

    async fn reject_merge(
        &self,
        entry: &RunEntry,
        run: &mut Run,
        stage: Option<String>,
        error: ContextError,
    ) -> Result<StageOutcome> {
        match error {
            ContextError::KeyCollision(key) => {
                let cause = FailureCause::ArtifactCollision { key };
                Ok(self.fail(entry, run, stage, cause).await)
            }
            ContextError::Sealed => Err(AppError::InvalidState(format!(
                "run {} context is sealed",
                run.context.run_id()
            ))),
        }
    }

    async fn fail(
        &self,
        entry: &RunEntry,
        run: &mut Run,
        stage: Option<String>,
        cause: FailureCause,
    ) -> StageOutcome {
        tracing::error!(
            run_id = %run.context.run_id(),
            stage = ?stage,
            class = ?cause.class(),
            error = %cause,
            "Run failed"
        );
        let outcome = StageOutcome::Failed { stage, cause };
        let index = run.context.stage_index();
        self.transition(entry, run, RunState::Failed, index, Some(outcome.clone()))
            .await;
        outcome
    }

    async fn finalize_cancelled(&self, entry: &RunEntry, run: &mut Run) -> StageOutcome {
        tracing::info!(run_id = %run.context.run_id(), state = %run.state(), "Run cancelled");
        let outcome = StageOutcome::Cancelled;
        let index = run.context.stage_index();
        self.transition(entry, run, RunState::Cancelled, index, Some(outcome.clone()))
            .await;
        outcome
    }

    /// Move to `state`, then persist and publish.
    async fn transition(
        &self,
        entry: &RunEntry,
        run: &mut Run,
        state: RunState,
        stage_index: usize,
        outcome: Option<StageOutcome>,
    ) {
        let from = run.state().clone();
        run.context.set_position(state, stage_index);
        if run.state().is_terminal() {
            run.context.seal();
        }
        if let Some(outcome) = outcome {
            run.history.push(outcome.clone());
            run.last_outcome = Some(outcome);
        }
        run.updated_at = Utc::now();

        tracing::info!(
            run_id = %run.context.run_id(),
            from = %from,
            to = %run.state(),
            "Run state changed"
        );

        self.save(run).await;
        *entry.status.write().await = run.status();
        self.publish(run);
    }

    async fn save(&self, run: &Run) {
        if let Err(e) = self.checkpoints.save(run).await {
            tracing::warn!(run_id = %run.context.run_id(), error = %e, "Failed to save checkpoint");
        }
    }

    fn publish(&self, run: &Run) {
        // No subscribers is fine.
        let _ = self.events.send(StatusEvent {
            run_id: run.context.run_id(),
            state: run.state().clone(),
            at: run.updated_at,
        });
    }
}

fn is_idle(state: &RunState) -> bool {
    matches!(state, RunState::Pending | RunState::AwaitingUserInput { .. })
}

/// The stage whose action plan was recorded but never reported on.
fn interrupted_apply(run: &Run) -> Option<(String, FailureCause)> {
    let RunState::RunningStage { name, .. } = run.state() else {
        return None;
    };
    if run.context.contains(&stage_key(name, EXECUTION_REPORT)) {
        return None;
    }
    let plan: ActionPlan =
        serde_json::from_value(run.context.value(&stage_key(name, ACTION_PLAN))?.clone()).ok()?;
    let cause = FailureCause::ApplyInterrupted {
        plan_id: plan.id,
        steps: plan.steps.len(),
    };
    Some((name.clone(), cause))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::ProviderRegistry;
    use crate::testing::{acme, FakeAccountGateway, FakeExecutor, ScriptedProvider};
    use crate::workflow::checkpoint::MemoryCheckpointStore;
    use crate::workflow::stage::PipelineSpec;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Harness {
        manager: WorkflowManager,
        providers: HashMap<String, Arc<ScriptedProvider>>,
        accounts: Arc<FakeAccountGateway>,
        executor: Arc<FakeExecutor>,
    }

    impl Harness {
        fn provider(&self, agent: &str) -> &Arc<ScriptedProvider> {
            &self.providers[agent]
        }
    }

    fn canned(agent: &str) -> Value {
        match agent {
            "data" => json!({"health_score": 7, "insights": ["steady renewals"]}),
            "risk" => json!({"risk": "medium", "confidence": 0.6}),
            "sentiment" => json!({"sentiment_score": 6.5}),
            "strategist" => json!({"recommendations": [
                {"id": "upsell", "title": "Upsell premium support", "rationale": "high case volume", "confidence": 0.8},
                {"id": "qbr", "title": "Schedule a QBR", "rationale": "exec sponsor quiet", "confidence": 0.5}
            ]}),
            "planner" => json!({"title": "Upsell plan", "steps": [
                {"operation": "create_task", "parameters": {"subject": "Call CFO"}},
                {"operation": "create_opportunity", "parameters": {"name": "Premium", "stage_name": "Prospecting", "close_date": "2026-12-01"}},
                {"operation": "log_activity", "parameters": {"subject": "Plan approved"}}
            ]}),
            _ => json!({}),
        }
    }

    fn config() -> WorkflowConfig {
        WorkflowConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..WorkflowConfig::default()
        }
    }

    fn harness_with(
        pipeline: PipelineSpec,
        executor: FakeExecutor,
        config: WorkflowConfig,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Harness {
        build_harness(pipeline, executor, config, checkpoints, None)
    }

    fn build_harness(
        mut pipeline: PipelineSpec,
        executor: FakeExecutor,
        config: WorkflowConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        delay: Option<Duration>,
    ) -> Harness {
        let mut registry = ProviderRegistry::new();
        let mut providers = HashMap::new();
        for stage in &mut pipeline.stages {
            for member in &mut stage.members {
                let id = member.agent.id.clone();
                member.agent.provider = Some(id.clone());
                let mut provider = ScriptedProvider::new(&id).with_fallback(canned(&id));
                if let Some(delay) = delay {
                    provider = provider.with_delay(delay);
                }
                let provider = Arc::new(provider);
                registry.register(&id, provider.clone(), 4);
                providers.insert(id, provider);
            }
        }
        let stages = Arc::new(StageRegistry::build(&pipeline, &registry, &config).unwrap());
        let accounts = Arc::new(FakeAccountGateway::new(acme()));
        let executor = Arc::new(executor);
        let manager = WorkflowManager::new(
            stages,
            accounts.clone(),
            executor.clone(),
            checkpoints,
            config,
        );
        Harness {
            manager,
            providers,
            accounts,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with(
            nba::default_pipeline(),
            FakeExecutor::new(),
            config(),
            Arc::new(MemoryCheckpointStore::default()),
        )
    }

    async fn state(h: &Harness, handle: WorkflowHandle) -> RunState {
        h.manager.status(handle).await.unwrap().state
    }

    #[tokio::test]
    async fn test_transient_risk_failure_retried_until_awaiting_input() {
        let h = harness();
        h.provider("risk")
            .push_err(ProviderError::Unavailable("503".to_string()));
        h.provider("risk")
            .push_err(ProviderError::Unavailable("503".to_string()));

        let handle = h.manager.start("001xx").await.unwrap();
        let outcome = h.manager.drive(handle).await.unwrap();

        match outcome {
            StageOutcome::AwaitingUserInput { recommendations, .. } => {
                assert_eq!(recommendations[0].id, "upsell");
                assert!(recommendations[0]
                    .source_artifacts
                    .contains(&"analysis.risk".to_string()));
            }
            other => panic!("expected awaiting input, got {other:?}"),
        }
        assert_eq!(h.provider("risk").calls(), 3);
        assert_eq!(
            state(&h, handle).await,
            RunState::AwaitingUserInput { next_stage: 2 }
        );

        let ctx = h.manager.context(handle).await.unwrap();
        assert_eq!(ctx.value(ACCOUNT_DATA_KEY).unwrap()["name"], "Acme");
        assert_eq!(ctx.value("analysis.risk").unwrap()["risk"], "medium");
        assert_eq!(ctx.get("analysis.risk").unwrap().confidence, Some(0.6));
        assert!(ctx.contains("strategy.recommendations"));
    }

    #[tokio::test]
    async fn test_full_run_applies_plan() {
        let h = harness();
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.drive(handle).await.unwrap();

        h.manager
            .select_recommendation(handle, "qbr")
            .await
            .unwrap();
        let outcome = h.manager.drive(handle).await.unwrap();

        match outcome {
            StageOutcome::Completed { report: Some(report) } => {
                assert!(report.is_complete());
                assert_eq!(report.completed_steps(), vec![1, 2, 3]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(h.executor.applied(), 3);

        let ctx = h.manager.context(handle).await.unwrap();
        assert!(ctx.is_sealed());
        assert_eq!(ctx.value(SELECTED_RECOMMENDATION_KEY).unwrap()["id"], "qbr");
        assert_eq!(ctx.value("execution.actionPlan").unwrap()["recommendationId"], "qbr");
        assert!(ctx.contains("execution.executionReport"));
        // The planner only saw what the execution stage projects.
        let prompt = &h.provider("planner").requests()[0].prompt;
        assert!(prompt.contains("\"recommendation\""));
        assert!(!prompt.contains("health_score"));
    }

    #[tokio::test]
    async fn test_advance_on_completed_run_is_idempotent() {
        let h = harness();
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.drive(handle).await.unwrap();
        h.manager.select_recommendation(handle, "upsell").await.unwrap();
        let first = h.manager.drive(handle).await.unwrap();
        let ctx_before = h.manager.context(handle).await.unwrap();

        let second = h.manager.advance(handle).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.manager.context(handle).await.unwrap(), ctx_before);
        assert_eq!(h.executor.applied(), 3);
    }

    #[tokio::test]
    async fn test_partial_failure_rejected_fails_run() {
        let mut pipeline = nba::default_pipeline();
        pipeline.stages[0].continue_on_partial = false;
        let h = harness_with(
            pipeline,
            FakeExecutor::new(),
            config(),
            Arc::new(MemoryCheckpointStore::default()),
        );
        h.provider("sentiment")
            .push_err(ProviderError::RateLimited("429".to_string()));

        let handle = h.manager.start("001xx").await.unwrap();
        let outcome = h.manager.drive(handle).await.unwrap();

        match outcome {
            StageOutcome::Failed {
                stage: Some(stage),
                cause: FailureCause::PartialFailureRejected { failed_agents, .. },
            } => {
                assert_eq!(stage, "analysis");
                assert_eq!(failed_agents, vec!["sentiment".to_string()]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(state(&h, handle).await, RunState::Failed);
        // Partial results are not retried and nothing of the stage is merged.
        assert_eq!(h.provider("data").calls(), 1);
        let ctx = h.manager.context(handle).await.unwrap();
        assert!(ctx.contains(ACCOUNT_DATA_KEY));
        assert!(!ctx.contains("analysis.data"));
    }

    #[tokio::test]
    async fn test_optional_failure_continues_when_allowed() {
        let h = harness();
        h.provider("sentiment")
            .push_err(ProviderError::Unavailable("down".to_string()));
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.advance(handle).await.unwrap();

        let outcome = h.manager.advance(handle).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::StageCompleted {
                stage: "analysis".to_string(),
                index: 0,
                failed_optional: vec!["sentiment".to_string()],
            }
        );
        let ctx = h.manager.context(handle).await.unwrap();
        assert!(!ctx.contains("analysis.sentiment"));
    }

    #[tokio::test]
    async fn test_partial_apply_fails_without_retry() {
        let h = harness_with(
            nba::default_pipeline(),
            FakeExecutor::failing_at(2),
            config(),
            Arc::new(MemoryCheckpointStore::default()),
        );
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.drive(handle).await.unwrap();
        h.manager.select_recommendation(handle, "upsell").await.unwrap();

        let outcome = h.manager.drive(handle).await.unwrap();
        match outcome {
            StageOutcome::Failed {
                cause: FailureCause::PartialApply { report },
                ..
            } => {
                assert_eq!(report.completed_steps(), vec![1]);
                assert_eq!(report.failed.as_ref().unwrap().step, 2);
                assert_eq!(report.not_attempted, vec![3]);
            }
            other => panic!("expected partial apply failure, got {other:?}"),
        }
        assert_eq!(h.executor.attempted(), 2);
        assert_eq!(h.provider("planner").calls(), 1);
        assert_eq!(state(&h, handle).await, RunState::Failed);
        let ctx = h.manager.context(handle).await.unwrap();
        assert!(ctx.contains("execution.executionReport"));
    }

    #[tokio::test]
    async fn test_dependency_cycle_fails_without_invocations() {
        let mut pipeline = nba::default_pipeline();
        pipeline.stages[0].members[0].depends_on = vec!["risk".to_string()];
        pipeline.stages[0].members[1].depends_on = vec!["data".to_string()];
        let h = harness_with(
            pipeline,
            FakeExecutor::new(),
            config(),
            Arc::new(MemoryCheckpointStore::default()),
        );

        let handle = h.manager.start("001xx").await.unwrap();
        let outcome = h.manager.drive(handle).await.unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                cause: FailureCause::DependencyCycle { .. },
                ..
            }
        ));
        assert_eq!(h.provider("data").calls(), 0);
        assert_eq!(h.provider("risk").calls(), 0);
        assert_eq!(h.provider("sentiment").calls(), 0);
    }

    #[tokio::test]
    async fn test_schema_violation_not_retried() {
        let h = harness();
        h.provider("strategist").push_ok(json!({"ideas": []}));
        let handle = h.manager.start("001xx").await.unwrap();
        let outcome = h.manager.drive(handle).await.unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                cause: FailureCause::SchemaViolation { .. },
                ..
            }
        ));
        assert_eq!(h.provider("strategist").calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_idle_run() {
        let h = harness();
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.drive(handle).await.unwrap();

        h.manager.cancel(handle).await.unwrap();
        assert_eq!(state(&h, handle).await, RunState::Cancelled);
        assert_eq!(h.manager.advance(handle).await.unwrap(), StageOutcome::Cancelled);

        let err = h.manager.select_recommendation(handle, "upsell").await;
        assert!(matches!(err, Err(AppError::InvalidState(_))));
        assert!(matches!(
            h.manager.cancel(handle).await,
            Err(AppError::InvalidState(_))
        ));
        let ctx = h.manager.context(handle).await.unwrap();
        assert!(ctx.is_sealed());
        assert!(ctx.contains("strategy.recommendations"));
    }

    #[tokio::test]
    async fn test_cancel_during_stage_drops_its_artifacts() {
        let h = build_harness(
            nba::default_pipeline(),
            FakeExecutor::new(),
            config(),
            Arc::new(MemoryCheckpointStore::default()),
            Some(Duration::from_millis(100)),
        );
        let handle = h.manager.start("001xx").await.unwrap();
        assert_eq!(h.manager.advance(handle).await.unwrap(), StageOutcome::DataFetched);

        let (outcome, cancelled) = tokio::join!(h.manager.advance(handle), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.manager.cancel(handle).await
        });
        cancelled.unwrap();

        assert_eq!(outcome.unwrap(), StageOutcome::Cancelled);
        // The agents in flight were allowed to finish.
        assert_eq!(h.provider("data").calls(), 1);
        assert_eq!(h.provider("risk").calls(), 1);
        assert_eq!(state(&h, handle).await, RunState::Cancelled);

        let ctx = h.manager.context(handle).await.unwrap();
        assert!(ctx.contains(ACCOUNT_DATA_KEY));
        assert!(!ctx.contains("analysis.data"));
        assert!(!ctx.contains("analysis.risk"));
        assert_eq!(h.provider("strategist").calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_selection_wait_for_brief_readers() {
        let h = harness();
        let first = h.manager.start("001xx").await.unwrap();
        h.manager.drive(first).await.unwrap();
        let second = h.manager.start("001xx").await.unwrap();
        h.manager.drive(second).await.unwrap();

        let entry = h.manager.entry(first).await.unwrap();
        let guard = entry.run.lock().await;
        let (selected, _) = tokio::join!(h.manager.select_recommendation(first, "upsell"), async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        selected.unwrap();
        assert_eq!(
            state(&h, first).await,
            RunState::RunningStage {
                index: 2,
                name: "execution".to_string()
            }
        );

        let entry = h.manager.entry(second).await.unwrap();
        let guard = entry.run.lock().await;
        let (cancelled, _) = tokio::join!(h.manager.cancel(second), async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        cancelled.unwrap();
        assert_eq!(state(&h, second).await, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_requested_while_awaiting_wins_over_suspension() {
        let h = harness();
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.drive(handle).await.unwrap();

        h.manager.entry(handle).await.unwrap().cancel.cancel();
        assert_eq!(h.manager.advance(handle).await.unwrap(), StageOutcome::Cancelled);
        assert_eq!(state(&h, handle).await, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_before_fetch_schedules_nothing() {
        let h = harness();
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.cancel(handle).await.unwrap();
        assert_eq!(h.manager.drive(handle).await.unwrap(), StageOutcome::Cancelled);
        assert_eq!(h.accounts.calls(), 0);
    }

    #[tokio::test]
    async fn test_selection_validated() {
        let h = harness();
        let handle = h.manager.start("001xx").await.unwrap();
        assert!(matches!(
            h.manager.select_recommendation(handle, "upsell").await,
            Err(AppError::InvalidState(_))
        ));

        h.manager.drive(handle).await.unwrap();
        assert!(matches!(
            h.manager.select_recommendation(handle, "nope").await,
            Err(AppError::InvalidRequest(_))
        ));
        assert_eq!(
            state(&h, handle).await,
            RunState::AwaitingUserInput { next_stage: 2 }
        );
    }

    #[tokio::test]
    async fn test_account_not_found_is_not_retried() {
        let h = harness();
        h.accounts
            .push_err(GatewayError::NotFound("001zz".to_string()));
        let handle = h.manager.start("001zz").await.unwrap();

        let outcome = h.manager.advance(handle).await.unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                stage: None,
                cause: FailureCause::AccountNotFound { .. }
            }
        ));
        assert_eq!(h.accounts.calls(), 1);
    }

    #[tokio::test]
    async fn test_gateway_unavailable_retried() {
        let h = harness();
        h.accounts
            .push_err(GatewayError::Unavailable("503".to_string()));
        let handle = h.manager.start("001xx").await.unwrap();
        assert_eq!(
            h.manager.advance(handle).await.unwrap(),
            StageOutcome::DataFetched
        );
        assert_eq!(h.accounts.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_run_and_empty_account() {
        let h = harness();
        let missing = WorkflowHandle {
            run_id: Uuid::new_v4(),
        };
        assert!(matches!(
            h.manager.status(missing).await,
            Err(AppError::RunNotFound(_))
        ));
        assert!(matches!(
            h.manager.start("  ").await,
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_discard_only_finished_runs() {
        let h = harness();
        let handle = h.manager.start("001xx").await.unwrap();
        assert!(matches!(
            h.manager.discard(handle).await,
            Err(AppError::InvalidState(_))
        ));
        h.manager.cancel(handle).await.unwrap();
        h.manager.discard(handle).await.unwrap();
        assert!(matches!(
            h.manager.status(handle).await,
            Err(AppError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
        let first = harness_with(
            nba::default_pipeline(),
            FakeExecutor::new(),
            config(),
            Arc::clone(&store),
        );
        let waiting = first.manager.start("001xx").await.unwrap();
        first.manager.drive(waiting).await.unwrap();
        let fresh = first.manager.start("001yy").await.unwrap();

        let second = harness_with(
            nba::default_pipeline(),
            FakeExecutor::new(),
            config(),
            store,
        );
        let resumable = second.manager.resume_persisted().await.unwrap();
        assert_eq!(resumable, vec![fresh]);

        let status = second.manager.status(waiting).await.unwrap();
        assert_eq!(status.recommendations.unwrap().len(), 2);
        second
            .manager
            .select_recommendation(waiting, "upsell")
            .await
            .unwrap();
        let outcome = second.manager.drive(waiting).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Completed { .. }));
        assert_eq!(second.provider("data").calls(), 0);
    }

    #[tokio::test]
    async fn test_plan_interrupted_mid_apply_is_not_reapplied() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
        let first = harness_with(
            nba::default_pipeline(),
            FakeExecutor::hanging_at(2),
            config(),
            Arc::clone(&store),
        );
        let handle = first.manager.start("001xx").await.unwrap();
        first.manager.drive(handle).await.unwrap();
        first
            .manager
            .select_recommendation(handle, "upsell")
            .await
            .unwrap();

        // The process stops while step 2 is in flight.
        let stopped =
            tokio::time::timeout(Duration::from_millis(200), first.manager.drive(handle)).await;
        assert!(stopped.is_err());
        assert_eq!(first.executor.applied(), 1);

        let second = harness_with(
            nba::default_pipeline(),
            FakeExecutor::new(),
            config(),
            store,
        );
        let resumable = second.manager.resume_persisted().await.unwrap();
        assert!(resumable.is_empty());

        let status = second.manager.status(handle).await.unwrap();
        assert_eq!(status.state, RunState::Failed);
        match status.last_outcome {
            Some(StageOutcome::Failed {
                stage: Some(stage),
                cause: FailureCause::ApplyInterrupted { plan_id, steps },
            }) => {
                assert_eq!(stage, "execution");
                assert_eq!(steps, 3);
                let ctx = second.manager.context(handle).await.unwrap();
                assert_eq!(ctx.value("execution.actionPlan").unwrap()["id"], plan_id.to_string());
            }
            other => panic!("expected interrupted apply, got {other:?}"),
        }

        // Driving it again neither re-plans nor re-applies.
        second.manager.drive(handle).await.unwrap();
        assert_eq!(second.executor.attempted(), 0);
        assert_eq!(second.provider("planner").calls(), 0);
    }

    #[tokio::test]
    async fn test_expire_stale_awaiting_run() {
        let h = harness_with(
            nba::default_pipeline(),
            FakeExecutor::new(),
            WorkflowConfig {
                awaiting_input_ttl_secs: Some(0),
                ..config()
            },
            Arc::new(MemoryCheckpointStore::default()),
        );
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.drive(handle).await.unwrap();

        assert_eq!(h.manager.expire_stale().await, (1, 0));
        assert_eq!(state(&h, handle).await, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_status_events_published() {
        let h = harness();
        let mut events = h.manager.subscribe();
        let handle = h.manager.start("001xx").await.unwrap();
        h.manager.drive(handle).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.run_id, handle.run_id);
            states.push(event.state);
        }
        assert_eq!(states.first(), Some(&RunState::Pending));
        assert!(states.contains(&RunState::FetchingData));
        assert_eq!(
            states.last(),
            Some(&RunState::AwaitingUserInput { next_stage: 2 })
        );
    }
}
