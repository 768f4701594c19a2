use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::error::{AppError, Result};
use crate::gateway::types::*;

fn text(record: &Value, field: &str) -> Option<String> {
    record.get(field).and_then(Value::as_str).map(str::to_string)
}

fn number(record: &Value, field: &str) -> Option<f64> {
    record.get(field).and_then(Value::as_f64)
}

fn flag(record: &Value, field: &str) -> bool {
    record.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn date(record: &Value, field: &str) -> Option<NaiveDate> {
    record
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok())
}

/// Map raw SOQL records to normalized account data.
pub fn map_account(
    account: &Value,
    contacts: &[Value],
    opportunities: &[Value],
    cases: &[Value],
    tasks: &[Value],
) -> AccountData {
    let mut data = AccountData::new(
        text(account, "Id").unwrap_or_default(),
        text(account, "Name").unwrap_or_default(),
        contacts.iter().map(map_contact).collect(),
        opportunities.iter().map(map_opportunity).collect(),
        cases.iter().map(map_case).collect(),
        tasks.iter().map(map_task).collect(),
    );
    data.account_type = text(account, "Type");
    data.industry = text(account, "Industry");
    data.annual_revenue = number(account, "AnnualRevenue");
    data.number_of_employees = account.get("NumberOfEmployees").and_then(Value::as_u64);
    data.rating = text(account, "Rating");
    data.description = text(account, "Description");
    data
}

fn map_contact(record: &Value) -> Contact {
    Contact {
        id: text(record, "Id").unwrap_or_default(),
        name: text(record, "Name").unwrap_or_default(),
        title: text(record, "Title"),
        email: text(record, "Email"),
        phone: text(record, "Phone"),
        last_activity_date: date(record, "LastActivityDate"),
    }
}

fn map_opportunity(record: &Value) -> Opportunity {
    Opportunity {
        id: text(record, "Id").unwrap_or_default(),
        name: text(record, "Name").unwrap_or_default(),
        stage_name: text(record, "StageName").unwrap_or_default(),
        amount: number(record, "Amount"),
        close_date: date(record, "CloseDate"),
        probability: number(record, "Probability"),
        is_closed: flag(record, "IsClosed"),
        is_won: flag(record, "IsWon"),
    }
}

fn map_case(record: &Value) -> Case {
    Case {
        id: text(record, "Id").unwrap_or_default(),
        case_number: text(record, "CaseNumber").unwrap_or_default(),
        subject: text(record, "Subject").unwrap_or_default(),
        status: text(record, "Status").unwrap_or_default(),
        priority: text(record, "Priority").unwrap_or_default(),
        created_date: text(record, "CreatedDate"),
    }
}

fn map_task(record: &Value) -> ActivityTask {
    ActivityTask {
        id: text(record, "Id").unwrap_or_default(),
        subject: text(record, "Subject").unwrap_or_default(),
        status: text(record, "Status").unwrap_or_default(),
        activity_date: date(record, "ActivityDate"),
        description: text(record, "Description"),
    }
}

/// A REST mutation derived from an action step.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create { sobject: &'static str, body: Value },
    Update { sobject: &'static str, id: String, body: Value },
}

fn param(params: &Map<String, Value>, key: &str) -> Option<Value> {
    params.get(key).filter(|v| !v.is_null()).cloned()
}

fn require(params: &Map<String, Value>, key: &str, step: &ActionStep) -> Result<Value> {
    param(params, key).ok_or_else(|| {
        AppError::InvalidRequest(format!("{} step is missing parameter '{key}'", step.operation))
    })
}

/// Salesforce record ids are 15 or 18 alphanumeric characters.
pub fn is_record_id(id: &str) -> bool {
    matches!(id.len(), 15 | 18) && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Translate an action step into the Salesforce record it writes.
pub fn map_step(account_id: &str, step: &ActionStep) -> Result<Mutation> {
    let p = &step.parameters;
    let what_id = if step.target_entity.is_empty() {
        account_id.to_string()
    } else {
        step.target_entity.clone()
    };

    let mutation = match step.operation {
        Operation::CreateTask => Mutation::Create {
            sobject: "Task",
            body: json!({
                "Subject": require(p, "subject", step)?,
                "Description": param(p, "description"),
                "ActivityDate": param(p, "due_date"),
                "Status": "Not Started",
                "Priority": param(p, "priority").unwrap_or_else(|| json!("Normal")),
                "WhatId": what_id,
            }),
        },
        Operation::LogActivity => Mutation::Create {
            sobject: "Task",
            body: json!({
                "Subject": require(p, "subject", step)?,
                "Description": param(p, "description"),
                "ActivityDate": param(p, "activity_date")
                    .unwrap_or_else(|| json!(chrono::Utc::now().date_naive().to_string())),
                "Status": "Completed",
                "WhatId": what_id,
            }),
        },
        Operation::CreateCase => Mutation::Create {
            sobject: "Case",
            body: json!({
                "Subject": require(p, "subject", step)?,
                "Description": param(p, "description"),
                "AccountId": account_id,
                "Status": "New",
                "Priority": param(p, "priority").unwrap_or_else(|| json!("Medium")),
            }),
        },
        Operation::CreateOpportunity => Mutation::Create {
            sobject: "Opportunity",
            body: json!({
                "Name": require(p, "name", step)?,
                "AccountId": account_id,
                "Amount": param(p, "amount"),
                "CloseDate": require(p, "close_date", step)?,
                "StageName": param(p, "stage_name").unwrap_or_else(|| json!("Prospecting")),
            }),
        },
        Operation::UpdateOpportunity => {
            if step.target_entity.is_empty() || step.target_entity == account_id {
                return Err(AppError::InvalidRequest(
                    "update_opportunity step needs an opportunity id as its target".to_string(),
                ));
            }
            // The id lands in the request path.
            if !is_record_id(&step.target_entity) {
                return Err(AppError::InvalidRequest(format!(
                    "update_opportunity target '{}' is not a Salesforce record id",
                    step.target_entity
                )));
            }
            let mut body = Map::new();
            body.insert("StageName".to_string(), require(p, "stage_name", step)?);
            if let Some(next_step) = param(p, "next_step") {
                body.insert("NextStep".to_string(), next_step);
            }
            Mutation::Update {
                sobject: "Opportunity",
                id: step.target_entity.clone(),
                body: Value::Object(body),
            }
        }
    };

    Ok(mutation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(operation: Operation, target: &str, params: Value) -> ActionStep {
        ActionStep {
            operation,
            target_entity: target.to_string(),
            parameters: params.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_map_account_computes_summary() {
        let account = json!({
            "Id": "001xx", "Name": "Acme", "Industry": "Manufacturing",
            "AnnualRevenue": 1200000.0, "NumberOfEmployees": 250, "Rating": null
        });
        let opps = vec![json!({
            "Id": "006a", "Name": "Expansion", "StageName": "Prospecting",
            "Amount": 5000.0, "CloseDate": "2026-03-01", "IsClosed": false, "IsWon": false
        })];
        let cases = vec![json!({
            "Id": "500a", "CaseNumber": "00001", "Subject": "Outage",
            "Status": "New", "Priority": "High", "CreatedDate": "2026-01-05T10:00:00.000+0000"
        })];

        let data = map_account(&account, &[], &opps, &cases, &[]);
        assert_eq!(data.name, "Acme");
        assert_eq!(data.rating, None);
        assert_eq!(data.number_of_employees, Some(250));
        assert_eq!(
            data.opportunities[0].close_date,
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(data.summary.open_pipeline_value, 5000.0);
        assert_eq!(data.summary.high_priority_cases, 1);
    }

    #[test]
    fn test_create_task_targets_account() {
        let mutation = map_step(
            "001xx",
            &step(
                Operation::CreateTask,
                "",
                json!({"subject": "Call CFO", "due_date": "2026-11-01"}),
            ),
        )
        .unwrap();
        match mutation {
            Mutation::Create { sobject, body } => {
                assert_eq!(sobject, "Task");
                assert_eq!(body["WhatId"], "001xx");
                assert_eq!(body["Status"], "Not Started");
                assert_eq!(body["ActivityDate"], "2026-11-01");
            }
            other => panic!("unexpected mutation: {other:?}"),
        }
    }

    #[test]
    fn test_update_opportunity_requires_record_id() {
        let err = map_step(
            "001xx",
            &step(Operation::UpdateOpportunity, "", json!({"stage_name": "Closed Won"})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("opportunity id"));

        let mutation = map_step(
            "001xx",
            &step(
                Operation::UpdateOpportunity,
                "006000000000001",
                json!({"stage_name": "Negotiation", "next_step": "Send quote"}),
            ),
        )
        .unwrap();
        assert_eq!(
            mutation,
            Mutation::Update {
                sobject: "Opportunity",
                id: "006000000000001".to_string(),
                body: json!({"StageName": "Negotiation", "NextStep": "Send quote"}),
            }
        );
    }

    #[test]
    fn test_update_opportunity_rejects_path_like_target() {
        for target in [
            "../Account/001000000000001?x=",
            "006000000000001/../../Account",
            "006000000000001?fields=Name",
            "006-00000000001",
            "00600000000001",
        ] {
            let err = map_step(
                "001000000000002",
                &step(
                    Operation::UpdateOpportunity,
                    target,
                    json!({"stage_name": "Closed Won"}),
                ),
            )
            .unwrap_err();
            assert!(
                matches!(err, AppError::InvalidRequest(ref msg) if msg.contains("not a Salesforce record id")),
                "target {target:?} accepted: {err}"
            );
        }
        assert!(is_record_id("006000000000001AAA"));
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let err = map_step("001xx", &step(Operation::CreateCase, "", json!({}))).unwrap_err();
        assert!(err.to_string().contains("'subject'"));
    }
}
