//! The built-in Next Best Action pipeline and the parsers for its derived artifacts.

use std::collections::HashSet;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::agent::schema::{FieldKind, FieldSpec, Schema};
use crate::agent::AgentSpec;
use crate::crew::MemberMode;
use crate::error::FailureCause;
use crate::gateway::types::{ActionPlan, ActionStep, Operation};
use crate::workflow::context::{ACCOUNT_DATA_KEY, SELECTED_RECOMMENDATION_KEY};
use crate::workflow::stage::{EmitSpec, InputBinding, MemberSpec, PipelineSpec, StageSpec};
use crate::workflow::types::Recommendation;

fn persona(id: &str, role: &str, goal: &str, instructions: &str, output: Schema) -> AgentSpec {
    AgentSpec {
        id: id.to_string(),
        role: role.to_string(),
        goal: goal.to_string(),
        instructions: instructions.to_string(),
        provider: None,
        input_schema: Schema::any(),
        output_schema: output,
        schema_version: 1,
        timeout_secs: None,
    }
}

fn member(agent: AgentSpec, mode: MemberMode) -> MemberSpec {
    MemberSpec {
        agent,
        mode,
        depends_on: Vec::new(),
    }
}

fn account_input() -> Schema {
    Schema::new(vec![FieldSpec::required(ACCOUNT_DATA_KEY, FieldKind::Object)])
}

/// analysis → strategy → (selection) → execution.
pub fn default_pipeline() -> PipelineSpec {
    let mut data = persona(
        "data",
        "Senior Data Analyst",
        "Analyze Salesforce account data to identify patterns, risks, and opportunities",
        "Score account health from 1 to 10 using pipeline, win rate, open cases and recent activity.",
        Schema::new(vec![
            FieldSpec::required("health_score", FieldKind::Integer),
            FieldSpec::required("insights", FieldKind::Array),
            FieldSpec::optional("opportunities", FieldKind::Array),
            FieldSpec::optional("confidence", FieldKind::Number),
        ]),
    );
    data.input_schema = account_input();

    let mut risk = persona(
        "risk",
        "Account Risk Analyst",
        "Assess churn and revenue risk for the account",
        "Answer with an overall risk level of low, medium or high, or null when the data cannot support one.",
        Schema::new(vec![
            FieldSpec::required("risk", FieldKind::String).nullable(),
            FieldSpec::optional("risks", FieldKind::Array),
            FieldSpec::optional("confidence", FieldKind::Number),
        ]),
    );
    risk.input_schema = account_input();

    let sentiment = persona(
        "sentiment",
        "Customer Sentiment Analyst",
        "Gauge customer sentiment from cases and recent activities",
        "Score sentiment from 0 to 10.",
        Schema::new(vec![
            FieldSpec::required("sentiment_score", FieldKind::Number),
            FieldSpec::optional("summary", FieldKind::String),
        ]),
    );

    let strategist = persona(
        "strategist",
        "Customer Success Strategist",
        "Develop strategic Next Best Actions based on account analysis",
        "Propose up to five ranked recommendations. Each needs a title, a rationale grounded in the analysis, and a confidence between 0 and 1.",
        Schema::new(vec![FieldSpec::required("recommendations", FieldKind::Array)
            .describe("Objects with id, title, rationale and confidence")]),
    );

    let planner = persona(
        "planner",
        "Salesforce Action Planner",
        "Turn the selected recommendation into concrete Salesforce actions",
        "Use only these operations: create_task, update_opportunity, create_case, log_activity, create_opportunity. Put the record to update in target_entity for update_opportunity.",
        Schema::new(vec![
            FieldSpec::required("title", FieldKind::String),
            FieldSpec::required("steps", FieldKind::Array)
                .describe("Objects with operation, target_entity and parameters"),
        ]),
    );

    PipelineSpec {
        stages: vec![
            StageSpec {
                name: "analysis".to_string(),
                inputs: vec![InputBinding::new(ACCOUNT_DATA_KEY)],
                members: vec![
                    member(data, MemberMode::Required),
                    member(risk, MemberMode::Required),
                    member(sentiment, MemberMode::Optional),
                ],
                continue_on_partial: true,
                requires_selection: false,
                emits: EmitSpec::Artifacts,
            },
            StageSpec {
                name: "strategy".to_string(),
                inputs: vec![
                    InputBinding::new(ACCOUNT_DATA_KEY),
                    InputBinding::new("analysis.data"),
                    InputBinding::new("analysis.risk"),
                    InputBinding::new("analysis.sentiment"),
                ],
                members: vec![member(strategist, MemberMode::Required)],
                continue_on_partial: false,
                requires_selection: false,
                emits: EmitSpec::Recommendations {
                    from_agent: "strategist".to_string(),
                },
            },
            StageSpec {
                name: "execution".to_string(),
                inputs: vec![
                    InputBinding::renamed(SELECTED_RECOMMENDATION_KEY, "recommendation"),
                    InputBinding::new(ACCOUNT_DATA_KEY),
                ],
                members: vec![member(planner, MemberMode::Required)],
                continue_on_partial: false,
                requires_selection: true,
                emits: EmitSpec::ActionPlan {
                    from_agent: "planner".to_string(),
                },
            },
        ],
    }
}

#[derive(Deserialize)]
struct RawRecommendation {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    rationale: String,
    #[serde(default, alias = "confidenceScore", alias = "confidence_score")]
    confidence: Option<f64>,
}

fn violation(agent: &str, reason: String) -> FailureCause {
    FailureCause::SchemaViolation {
        agent: agent.to_string(),
        reason,
    }
}

/// Read ranked recommendations out of `agent`'s payload, highest confidence first.
pub fn parse_recommendations(
    agent: &str,
    payload: &Value,
    sources: &[String],
) -> Result<Vec<Recommendation>, FailureCause> {
    let items = payload
        .get("recommendations")
        .cloned()
        .unwrap_or(Value::Null);
    let raw: Vec<RawRecommendation> = serde_json::from_value(items)
        .map_err(|e| violation(agent, format!("malformed recommendations: {e}")))?;
    if raw.is_empty() {
        return Err(violation(agent, "no recommendations produced".to_string()));
    }

    let mut seen = HashSet::new();
    let mut recommendations = Vec::with_capacity(raw.len());
    for (i, item) in raw.into_iter().enumerate() {
        let id = item.id.unwrap_or_else(|| format!("rec-{}", i + 1));
        if !seen.insert(id.clone()) {
            return Err(violation(agent, format!("duplicate recommendation id '{id}'")));
        }
        recommendations.push(Recommendation {
            id,
            title: item.title,
            rationale: item.rationale,
            confidence_score: item.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            source_artifacts: sources.to_vec(),
        });
    }

    // Stable, so equal scores keep the agent's order.
    recommendations.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
    Ok(recommendations)
}

#[derive(Deserialize)]
struct RawStep {
    operation: Operation,
    #[serde(default, alias = "targetEntity")]
    target_entity: Option<String>,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
}

/// Build a fresh, immutable plan from `agent`'s payload.
pub fn parse_action_plan(
    agent: &str,
    payload: &Value,
    account_id: &str,
    recommendation_id: &str,
) -> Result<ActionPlan, FailureCause> {
    let title = payload
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let steps = payload.get("steps").cloned().unwrap_or(Value::Null);
    let raw: Vec<RawStep> = serde_json::from_value(steps)
        .map_err(|e| violation(agent, format!("malformed action steps: {e}")))?;
    if raw.is_empty() {
        return Err(violation(agent, "action plan has no steps".to_string()));
    }

    Ok(ActionPlan {
        id: Uuid::new_v4(),
        account_id: account_id.to_string(),
        recommendation_id: recommendation_id.to_string(),
        title,
        steps: raw
            .into_iter()
            .map(|step| ActionStep {
                operation: step.operation,
                target_entity: step
                    .target_entity
                    .unwrap_or_else(|| account_id.to_string()),
                parameters: step.parameters,
            })
            .collect(),
        created_at: Utc::now(),
    })
}
