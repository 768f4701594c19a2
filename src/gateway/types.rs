use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized account data, stored as the first artifact of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub annual_revenue: Option<f64>,
    #[serde(default)]
    pub number_of_employees: Option<u64>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub opportunities: Vec<Opportunity>,
    #[serde(default)]
    pub cases: Vec<Case>,
    #[serde(default)]
    pub tasks: Vec<ActivityTask>,
    #[serde(default)]
    pub summary: AccountSummary,
}

impl AccountData {
    /// Build account data with `summary` derived from the related records.
    pub fn new(
        id: String,
        name: String,
        contacts: Vec<Contact>,
        opportunities: Vec<Opportunity>,
        cases: Vec<Case>,
        tasks: Vec<ActivityTask>,
    ) -> Self {
        let summary = AccountSummary::compute(&contacts, &opportunities, &cases);
        Self {
            id,
            name,
            account_type: None,
            industry: None,
            annual_revenue: None,
            number_of_employees: None,
            rating: None,
            description: None,
            contacts,
            opportunities,
            cases,
            tasks,
            summary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub last_activity_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub name: String,
    pub stage_name: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub close_date: Option<NaiveDate>,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub is_closed: bool,
    #[serde(default)]
    pub is_won: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: String,
    pub case_number: String,
    pub subject: String,
    pub status: String,
    pub priority: String,
    #[serde(default)]
    pub created_date: Option<String>,
}

impl Case {
    pub fn is_open(&self) -> bool {
        !self.status.eq_ignore_ascii_case("closed")
    }
}

/// A Salesforce Task record (named to avoid clashing with queue tasks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityTask {
    pub id: String,
    pub subject: String,
    pub status: String,
    #[serde(default)]
    pub activity_date: Option<NaiveDate>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Metrics derived from an account's related records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub open_opportunities: usize,
    pub open_pipeline_value: f64,
    pub open_cases: usize,
    pub high_priority_cases: usize,
    pub won_revenue: f64,
    /// Won / closed opportunities, 0 when nothing has closed.
    pub win_rate: f64,
    pub total_contacts: usize,
}

impl AccountSummary {
    pub fn compute(contacts: &[Contact], opportunities: &[Opportunity], cases: &[Case]) -> Self {
        let open: Vec<&Opportunity> = opportunities.iter().filter(|o| !o.is_closed).collect();
        let closed = opportunities.iter().filter(|o| o.is_closed).count();
        let won: Vec<&Opportunity> = opportunities
            .iter()
            .filter(|o| o.is_closed && o.is_won)
            .collect();
        let open_cases: Vec<&Case> = cases.iter().filter(|c| c.is_open()).collect();

        Self {
            open_opportunities: open.len(),
            open_pipeline_value: open.iter().filter_map(|o| o.amount).sum(),
            open_cases: open_cases.len(),
            high_priority_cases: open_cases
                .iter()
                .filter(|c| c.priority.eq_ignore_ascii_case("high"))
                .count(),
            won_revenue: won.iter().filter_map(|o| o.amount).sum(),
            win_rate: if closed == 0 {
                0.0
            } else {
                won.len() as f64 / closed as f64
            },
            total_contacts: contacts.len(),
        }
    }
}

/// Salesforce mutation an action step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateTask,
    UpdateOpportunity,
    CreateCase,
    LogActivity,
    CreateOpportunity,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CreateTask => "create_task",
            Operation::UpdateOpportunity => "update_opportunity",
            Operation::CreateCase => "create_case",
            Operation::LogActivity => "log_activity",
            Operation::CreateOpportunity => "create_opportunity",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    pub operation: Operation,
    /// Record the step acts on: the account for creations, the record id for updates.
    pub target_entity: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// An approved, immutable sequence of Salesforce mutations.
///
/// Plans are never edited in place; a changed plan is a new plan with a new id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlan {
    pub id: Uuid,
    pub account_id: String,
    pub recommendation_id: String,
    pub title: String,
    pub steps: Vec<ActionStep>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedStep {
    /// 1-based position in the plan.
    pub step: usize,
    pub operation: Operation,
    #[serde(default)]
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub step: usize,
    pub operation: Operation,
    pub cause: String,
}

/// Which steps of a plan were applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub plan_id: Uuid,
    pub total_steps: usize,
    pub completed: Vec<CompletedStep>,
    #[serde(default)]
    pub failed: Option<FailedStep>,
    /// 1-based positions of steps never attempted.
    #[serde(default)]
    pub not_attempted: Vec<usize>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.completed.len() == self.total_steps
    }

    pub fn completed_steps(&self) -> Vec<usize> {
        self.completed.iter().map(|c| c.step).collect()
    }

    pub fn failure_summary(&self) -> String {
        let mut summary = format!("completed steps {:?}", self.completed_steps());
        if let Some(failed) = &self.failed {
            summary.push_str(&format!(
                ", step {} ({}) failed: {}",
                failed.step, failed.operation, failed.cause
            ));
        }
        if !self.not_attempted.is_empty() {
            summary.push_str(&format!(", not attempted {:?}", self.not_attempted));
        }
        summary
    }
}
