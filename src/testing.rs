//! Scripted providers and fake gateways shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{SalesforceConfig, WorkflowConfig};
use crate::error::{AppError, ApplyError, GatewayError, ProviderError};
use crate::gateway::types::{AccountData, ActionPlan, ActionStep, ExecutionReport, Operation};
use crate::gateway::{apply_plan, AccountDataGateway, ExecutionGateway, StepExecutor};
use crate::provider::{CapabilityProvider, CompletionRequest, ProviderRegistry};
use crate::workflow::checkpoint::MemoryCheckpointStore;
use crate::workflow::nba::default_pipeline;
use crate::workflow::stage::StageRegistry;
use crate::workflow::WorkflowManager;

/// Provider that answers from a queue of canned results.
///
/// With an empty queue it answers with the fallback payload, or reports
/// itself unavailable when there is none.
pub struct ScriptedProvider {
    name: String,
    delay: Option<Duration>,
    script: Mutex<VecDeque<Result<Value, ProviderError>>>,
    fallback: Mutex<Option<Value>>,
    requests: Mutex<Vec<CompletionRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_fallback(self, payload: Value) -> Self {
        *self.fallback.lock().unwrap() = Some(payload);
        self
    }

    pub fn push_ok(&self, payload: Value) {
        self.script.lock().unwrap().push_back(Ok(payload));
    }

    pub fn push_err(&self, error: ProviderError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn max_observed_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Value, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match next {
            Some(result) => result,
            None => self
                .fallback
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ProviderError::Unavailable("script exhausted".to_string())),
        }
    }
}

/// Account gateway returning scripted errors first, then a fixed account.
pub struct FakeAccountGateway {
    account: AccountData,
    errors: Mutex<VecDeque<GatewayError>>,
    calls: AtomicUsize,
}

impl FakeAccountGateway {
    pub fn new(account: AccountData) -> Self {
        Self {
            account,
            errors: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_err(&self, error: GatewayError) {
        self.errors.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountDataGateway for FakeAccountGateway {
    async fn fetch_account(&self, account_id: &str) -> Result<AccountData, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut account = self.account.clone();
        account.id = account_id.to_string();
        Ok(account)
    }
}

pub fn acme() -> AccountData {
    AccountData::new(
        "001xx".to_string(),
        "Acme".to_string(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
    )
}

/// Step executor that rejects, or never returns from, the step at one
/// 1-based position.
pub struct FakeExecutor {
    fail_at: Option<usize>,
    hang_at: Option<usize>,
    attempted: AtomicUsize,
    applied: AtomicUsize,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            fail_at: None,
            hang_at: None,
            attempted: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(step: usize) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new()
        }
    }

    pub fn hanging_at(step: usize) -> Self {
        Self {
            hang_at: Some(step),
            ..Self::new()
        }
    }

    /// Steps applied successfully so far, across all plans.
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn attempted(&self) -> usize {
        self.attempted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for FakeExecutor {
    async fn execute_step(
        &self,
        _account_id: &str,
        step: &ActionStep,
    ) -> crate::error::Result<Option<String>> {
        let position = self.attempted.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang_at == Some(position) {
            std::future::pending::<()>().await;
        }
        if self.fail_at == Some(position) {
            return Err(AppError::Salesforce(format!(
                "{} rejected by validation rule",
                step.operation
            )));
        }
        let n = self.applied.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("00T00000000000{n}")))
    }
}

#[async_trait]
impl ExecutionGateway for FakeExecutor {
    async fn apply(&self, plan: &ActionPlan) -> Result<ExecutionReport, ApplyError> {
        apply_plan(self, plan).await
    }
}

pub fn sample_plan(steps: usize) -> ActionPlan {
    ActionPlan {
        id: Uuid::new_v4(),
        account_id: "001xx".to_string(),
        recommendation_id: "rec-1".to_string(),
        title: "Re-engage Acme".to_string(),
        steps: (1..=steps)
            .map(|i| ActionStep {
                operation: Operation::CreateTask,
                target_entity: "001xx".to_string(),
                parameters: json!({"subject": format!("Follow-up {i}")})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect(),
        created_at: Utc::now(),
    }
}

pub fn salesforce_config(login_url: &str) -> SalesforceConfig {
    SalesforceConfig {
        login_url: login_url.to_string(),
        api_version: "v59.0".to_string(),
        client_id: "cid".to_string(),
        client_secret: "secret".to_string(),
        username: "ops@example.com".to_string(),
        password: "hunter2".to_string(),
        security_token: "tok".to_string(),
        token_ttl_secs: 3600,
    }
}

/// One payload that satisfies every agent of the built-in pipeline.
pub fn universal_payload() -> Value {
    json!({
        "health_score": 7,
        "insights": ["renewal due next quarter"],
        "risk": "medium",
        "sentiment_score": 6.0,
        "recommendations": [
            {"id": "upsell", "title": "Upsell premium support", "rationale": "case volume", "confidence": 0.8}
        ],
        "title": "Upsell plan",
        "steps": [
            {"operation": "create_task", "parameters": {"subject": "Call CFO"}}
        ]
    })
}

/// Manager over the built-in pipeline with scripted collaborators.
pub fn nba_manager() -> WorkflowManager {
    let config = WorkflowConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        ..WorkflowConfig::default()
    };
    let mut providers = ProviderRegistry::new();
    providers.register(
        &config.default_provider,
        Arc::new(ScriptedProvider::new("scripted").with_fallback(universal_payload())),
        8,
    );
    let stages = StageRegistry::build(&default_pipeline(), &providers, &config).unwrap();
    WorkflowManager::new(
        Arc::new(stages),
        Arc::new(FakeAccountGateway::new(acme())),
        Arc::new(FakeExecutor::new()),
        Arc::new(MemoryCheckpointStore::default()),
        config,
    )
}
