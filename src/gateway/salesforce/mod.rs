pub mod auth;
pub mod client;
pub mod mapper;

use async_trait::async_trait;

use crate::config::SalesforceConfig;
use crate::error::{AppError, ApplyError, GatewayError};
use crate::gateway::types::{AccountData, ActionPlan, ActionStep, ExecutionReport};
use crate::gateway::{apply_plan, AccountDataGateway, ExecutionGateway, StepExecutor};

use client::SalesforceClient;
use mapper::Mutation;

/// Related-record lists are capped to keep agent prompts bounded.
const RELATED_LIMIT: usize = 20;

/// Both gateways backed by one Salesforce org.
pub struct SalesforceGateway {
    client: SalesforceClient,
}

impl SalesforceGateway {
    pub fn new(config: &SalesforceConfig) -> Self {
        Self {
            client: SalesforceClient::new(config),
        }
    }

    fn validate_id(account_id: &str) -> Result<(), GatewayError> {
        if mapper::is_record_id(account_id) {
            Ok(())
        } else {
            Err(GatewayError::NotFound(account_id.to_string()))
        }
    }

    async fn related(&self, soql: String) -> Result<Vec<serde_json::Value>, GatewayError> {
        self.client.query(&soql).await.map_err(map_fetch_error)
    }
}

fn map_fetch_error(e: AppError) -> GatewayError {
    match e {
        AppError::SalesforceNotFound(what) => GatewayError::NotFound(what),
        other => GatewayError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl AccountDataGateway for SalesforceGateway {
    async fn fetch_account(&self, account_id: &str) -> Result<AccountData, GatewayError> {
        Self::validate_id(account_id)?;

        let account = self
            .related(format!(
                "SELECT Id, Name, Type, Industry, AnnualRevenue, NumberOfEmployees, Rating, \
                 Description FROM Account WHERE Id = '{account_id}'"
            ))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::NotFound(account_id.to_string()))?;

        let contacts = self
            .related(format!(
                "SELECT Id, Name, Title, Email, Phone, LastActivityDate FROM Contact \
                 WHERE AccountId = '{account_id}'"
            ))
            .await?;
        let opportunities = self
            .related(format!(
                "SELECT Id, Name, StageName, Amount, CloseDate, Probability, IsClosed, IsWon \
                 FROM Opportunity WHERE AccountId = '{account_id}' ORDER BY CloseDate DESC"
            ))
            .await?;
        let cases = self
            .related(format!(
                "SELECT Id, CaseNumber, Subject, Status, Priority, CreatedDate FROM Case \
                 WHERE AccountId = '{account_id}' ORDER BY CreatedDate DESC LIMIT {RELATED_LIMIT}"
            ))
            .await?;
        let tasks = self
            .related(format!(
                "SELECT Id, Subject, Status, ActivityDate, Description FROM Task \
                 WHERE AccountId = '{account_id}' ORDER BY ActivityDate DESC LIMIT {RELATED_LIMIT}"
            ))
            .await?;

        tracing::info!(
            account_id,
            contacts = contacts.len(),
            opportunities = opportunities.len(),
            cases = cases.len(),
            tasks = tasks.len(),
            "Fetched account data"
        );

        Ok(mapper::map_account(
            &account,
            &contacts,
            &opportunities,
            &cases,
            &tasks,
        ))
    }
}

#[async_trait]
impl StepExecutor for SalesforceGateway {
    async fn execute_step(
        &self,
        account_id: &str,
        step: &ActionStep,
    ) -> crate::error::Result<Option<String>> {
        match mapper::map_step(account_id, step)? {
            Mutation::Create { sobject, body } => {
                let id = self.client.create(sobject, &body).await?;
                Ok(Some(id))
            }
            Mutation::Update { sobject, id, body } => {
                self.client.update(sobject, &id, &body).await?;
                Ok(Some(id))
            }
        }
    }
}

#[async_trait]
impl ExecutionGateway for SalesforceGateway {
    async fn apply(&self, plan: &ActionPlan) -> Result<ExecutionReport, ApplyError> {
        apply_plan(self, plan).await
    }
}
