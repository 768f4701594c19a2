use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ContextError;
use crate::workflow::types::RunState;

/// Read-only view of context values handed to a crew.
pub type Snapshot = serde_json::Map<String, serde_json::Value>;

pub const ACCOUNT_DATA_KEY: &str = "accountData";
pub const SELECTED_RECOMMENDATION_KEY: &str = "selectedRecommendation";

/// Key under which a stage stores one of its artifacts.
pub fn stage_key(stage: &str, name: &str) -> String {
    format!("{stage}.{name}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub value: serde_json::Value,
    /// Stage, agent, or actor that recorded the value.
    pub produced_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(value: serde_json::Value, produced_by: &str) -> Self {
        Self {
            value,
            produced_by: produced_by.to_string(),
            confidence: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Append-only, insertion-ordered artifact log of one run plus its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    run_id: Uuid,
    account_id: String,
    stage_index: usize,
    state: RunState,
    artifacts: IndexMap<String, Artifact>,
    #[serde(default)]
    sealed: bool,
}

impl WorkflowContext {
    pub fn new(run_id: Uuid, account_id: &str) -> Self {
        Self {
            run_id,
            account_id: account_id.to_string(),
            stage_index: 0,
            state: RunState::Pending,
            artifacts: IndexMap::new(),
            sealed: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub(crate) fn set_position(&mut self, state: RunState, stage_index: usize) {
        self.state = state;
        self.stage_index = stage_index;
    }

    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.artifacts.get(key).map(|a| &a.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn insert(&mut self, key: &str, artifact: Artifact) -> Result<(), ContextError> {
        self.merge(vec![(key.to_string(), artifact)])
    }

    /// Insert every artifact or none of them.
    pub fn merge(&mut self, artifacts: Vec<(String, Artifact)>) -> Result<(), ContextError> {
        if self.sealed {
            return Err(ContextError::Sealed);
        }
        for (i, (key, _)) in artifacts.iter().enumerate() {
            let repeated = artifacts[..i].iter().any(|(k, _)| k == key);
            if repeated || self.artifacts.contains_key(key) {
                return Err(ContextError::KeyCollision(key.clone()));
            }
        }
        self.artifacts.extend(artifacts);
        Ok(())
    }

    /// Forbid any further artifact mutation.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn snapshot(&self) -> Snapshot {
        self.artifacts
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            stage_index: self.stage_index,
            sealed: self.sealed,
            artifacts: self
                .artifacts
                .iter()
                .map(|(key, a)| ArtifactSummary {
                    key: key.clone(),
                    produced_by: a.produced_by.clone(),
                    confidence: a.confidence,
                    recorded_at: a.recorded_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub key: String,
    pub produced_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Artifact metadata without values, for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub stage_index: usize,
    pub sealed: bool,
    pub artifacts: Vec<ArtifactSummary>,
}
