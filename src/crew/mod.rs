pub mod plan;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentOutput};
use crate::error::FailureCause;
use crate::workflow::context::Snapshot;
use crate::workflow::types::StageResult;

/// Whether a member's failure sinks the crew.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberMode {
    #[default]
    Required,
    Optional,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberRule {
    pub mode: MemberMode,
    pub depends_on: Vec<String>,
}

/// Per-member execution mode and dependencies.
///
/// Members without an entry are required and depend on nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberPolicy {
    members: IndexMap<String, MemberRule>,
}

impl MemberPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, agent_id: &str, mode: MemberMode, depends_on: &[&str]) -> Self {
        self.members.insert(
            agent_id.to_string(),
            MemberRule {
                mode,
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        );
        self
    }

    pub fn required(self, agent_id: &str, depends_on: &[&str]) -> Self {
        self.with_rule(agent_id, MemberMode::Required, depends_on)
    }

    pub fn optional(self, agent_id: &str, depends_on: &[&str]) -> Self {
        self.with_rule(agent_id, MemberMode::Optional, depends_on)
    }

    pub fn insert(&mut self, agent_id: &str, rule: MemberRule) {
        self.members.insert(agent_id.to_string(), rule);
    }

    pub fn rule(&self, agent_id: &str) -> MemberRule {
        self.members.get(agent_id).cloned().unwrap_or_default()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }
}

/// A named group of agents producing one composite result.
pub struct Crew {
    name: String,
    agents: Vec<Arc<Agent>>,
    timeout: Duration,
}

impl Crew {
    pub fn new(name: &str, agents: Vec<Agent>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            agents: agents.into_iter().map(Arc::new).collect(),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.id()).collect()
    }

    /// Run every member once, in dependency waves, and aggregate the results.
    ///
    /// Members are never retried here. After a required failure no further
    /// wave starts; cancellation is honored between waves.
    pub async fn run(
        &self,
        snapshot: &Snapshot,
        policy: &MemberPolicy,
        cancel: &CancellationToken,
    ) -> StageResult {
        let ids = self.agent_ids();
        let waves = match plan::build_waves(&self.name, &ids, policy) {
            Ok(waves) => waves,
            Err(error) => {
                tracing::error!(crew = %self.name, error = %error, "Crew configuration rejected");
                return StageResult::Fatal { error };
            }
        };

        let mut outputs: HashMap<usize, AgentOutput> = HashMap::new();
        let mut failures: HashMap<usize, FailureCause> = HashMap::new();
        // Required failures in discovery order: earliest wave first, then declaration order.
        let mut required_failures: Vec<usize> = Vec::new();

        for (wave_index, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(crew = %self.name, wave = wave_index, "Crew cancelled between waves");
                return StageResult::Fatal {
                    error: FailureCause::Cancelled {
                        reason: format!("crew '{}' stopped before wave {wave_index}", self.name),
                    },
                };
            }

            tracing::debug!(crew = %self.name, wave = wave_index, members = wave.len(), "Starting wave");

            let mut join_set = JoinSet::new();
            let mut spawned = HashSet::new();

            for &i in wave {
                let id = ids[i];
                let rule = policy.rule(id);

                let failed_dep = rule.depends_on.iter().find_map(|dep| {
                    let d = ids.iter().position(|m| *m == dep.as_str())?;
                    failures.get(&d).map(|cause| (dep.clone(), cause.clone()))
                });
                if let Some((dependency, upstream)) = failed_dep {
                    tracing::warn!(crew = %self.name, agent = id, dependency = %dependency, "Skipping member with failed dependency");
                    failures.insert(
                        i,
                        FailureCause::DependencyFailed {
                            agent: id.to_string(),
                            dependency,
                            upstream: Box::new(upstream),
                        },
                    );
                    continue;
                }

                let mut dependencies = serde_json::Map::new();
                for dep in &rule.depends_on {
                    if let Some(output) = ids
                        .iter()
                        .position(|m| *m == dep.as_str())
                        .and_then(|d| outputs.get(&d))
                    {
                        dependencies.insert(dep.clone(), output.payload.clone());
                    }
                }
                let mut input = snapshot.clone();
                input.insert(
                    "dependencies".to_string(),
                    serde_json::Value::Object(dependencies),
                );
                let input = serde_json::Value::Object(input);

                let agent = Arc::clone(&self.agents[i]);
                let timeout = self.timeout;
                spawned.insert(i);
                join_set.spawn(async move { (i, agent.invoke(&input, timeout).await) });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((i, Ok(output))) => {
                        spawned.remove(&i);
                        outputs.insert(i, output);
                    }
                    Ok((i, Err(cause))) => {
                        spawned.remove(&i);
                        failures.insert(i, cause);
                    }
                    Err(e) => {
                        tracing::error!(crew = %self.name, error = %e, "Crew member task aborted");
                    }
                }
            }
            // Members whose task panicked never reported back.
            for i in spawned {
                failures.insert(
                    i,
                    FailureCause::ProviderUnavailable {
                        agent: ids[i].to_string(),
                        reason: "agent task aborted".to_string(),
                    },
                );
            }

            for &i in wave {
                if let Some(cause) = failures.get(&i) {
                    let mode = policy.rule(ids[i]).mode;
                    tracing::warn!(crew = %self.name, agent = ids[i], mode = ?mode, error = %cause, "Crew member failed");
                    if mode == MemberMode::Required {
                        required_failures.push(i);
                    }
                }
            }

            if let Some(&first) = required_failures.first() {
                let error = failures
                    .remove(&first)
                    .unwrap_or_else(|| FailureCause::Misconfigured {
                        scope: self.name.clone(),
                        reason: "lost failure cause".to_string(),
                    });
                return StageResult::Fatal { error };
            }
        }

        let mut ordered_outputs = Vec::with_capacity(outputs.len());
        let mut failed_agents = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            if let Some(output) = outputs.remove(&i) {
                ordered_outputs.push(output);
            } else if let Some(cause) = failures.remove(&i) {
                failed_agents.push((id.to_string(), cause));
            }
        }

        if failed_agents.is_empty() {
            StageResult::Success {
                outputs: ordered_outputs,
            }
        } else {
            StageResult::PartialFailure {
                outputs: ordered_outputs,
                failed_agents,
            }
        }
    }
}
