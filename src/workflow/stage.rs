use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentSpec};
use crate::config::WorkflowConfig;
use crate::crew::{Crew, MemberMode, MemberPolicy, MemberRule};
use crate::error::{AppError, Result};
use crate::provider::ProviderRegistry;
use crate::workflow::context::{Snapshot, WorkflowContext};
use crate::workflow::types::StageResult;

/// A context key a stage may read, optionally renamed for its crew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub from: String,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl InputBinding {
    pub fn new(from: &str) -> Self {
        Self {
            from: from.to_string(),
            alias: None,
        }
    }

    pub fn renamed(from: &str, alias: &str) -> Self {
        Self {
            from: from.to_string(),
            alias: Some(alias.to_string()),
        }
    }

    pub fn target(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub agent: AgentSpec,
    #[serde(default)]
    pub mode: MemberMode,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Derived artifact a stage records besides its agents' outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmitSpec {
    #[default]
    Artifacts,
    Recommendations {
        from_agent: String,
    },
    ActionPlan {
        from_agent: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    pub members: Vec<MemberSpec>,
    #[serde(default)]
    pub continue_on_partial: bool,
    /// The run pauses for a recommendation selection before this stage.
    #[serde(default)]
    pub requires_selection: bool,
    #[serde(default)]
    pub emits: EmitSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
}

/// A stage bound to its crew.
pub struct Stage {
    spec: StageSpec,
    crew: Crew,
    policy: MemberPolicy,
}

impl Stage {
    pub fn new(spec: StageSpec, crew: Crew, policy: MemberPolicy) -> Self {
        Self { spec, crew, policy }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn continue_on_partial(&self) -> bool {
        self.spec.continue_on_partial
    }

    pub fn requires_selection(&self) -> bool {
        self.spec.requires_selection
    }

    pub fn emits(&self) -> &EmitSpec {
        &self.spec.emits
    }

    /// The subset of context this stage's crew may see. Missing keys are left out.
    pub fn project(&self, context: &WorkflowContext) -> Snapshot {
        self.spec
            .inputs
            .iter()
            .filter_map(|binding| {
                context
                    .value(&binding.from)
                    .map(|v| (binding.target().to_string(), v.clone()))
            })
            .collect()
    }

    /// Context keys the projection actually drew on.
    pub fn source_keys(&self, context: &WorkflowContext) -> Vec<String> {
        self.spec
            .inputs
            .iter()
            .filter(|binding| context.contains(&binding.from))
            .map(|binding| binding.from.clone())
            .collect()
    }

    pub async fn execute(
        &self,
        context: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> StageResult {
        let snapshot = self.project(context);
        tracing::info!(
            stage = %self.spec.name,
            inputs = snapshot.len(),
            members = self.spec.members.len(),
            "Executing stage"
        );
        self.crew.run(&snapshot, &self.policy, cancel).await
    }
}

/// The pipeline's stages in order, fixed after startup.
pub struct StageRegistry {
    stages: Vec<Arc<Stage>>,
}

impl StageRegistry {
    pub fn build(
        pipeline: &PipelineSpec,
        providers: &ProviderRegistry,
        workflow: &WorkflowConfig,
    ) -> Result<Self> {
        if pipeline.stages.is_empty() {
            return Err(AppError::Pipeline("pipeline has no stages".to_string()));
        }

        let mut stages = Vec::with_capacity(pipeline.stages.len());
        let mut seen = HashSet::new();
        let mut recommendations_seen = false;

        for (index, spec) in pipeline.stages.iter().enumerate() {
            if !seen.insert(spec.name.as_str()) {
                return Err(AppError::Pipeline(format!(
                    "duplicate stage name '{}'",
                    spec.name
                )));
            }
            if spec.members.is_empty() {
                return Err(AppError::Pipeline(format!(
                    "stage '{}' has no members",
                    spec.name
                )));
            }
            if spec.requires_selection && !recommendations_seen {
                return Err(AppError::Pipeline(format!(
                    "stage '{}' requires a selection but no earlier stage emits recommendations",
                    spec.name
                )));
            }

            let mut ids = HashSet::new();
            let mut agents = Vec::with_capacity(spec.members.len());
            let mut policy = MemberPolicy::new();

            for member in &spec.members {
                let id = member.agent.id.as_str();
                if !ids.insert(id) {
                    return Err(AppError::Pipeline(format!(
                        "stage '{}' declares agent '{id}' twice",
                        spec.name
                    )));
                }
                let provider_name = member
                    .agent
                    .provider
                    .as_deref()
                    .unwrap_or(&workflow.default_provider);
                let provider = providers.get(provider_name).ok_or_else(|| {
                    AppError::Config(format!(
                        "agent '{id}' in stage '{}' uses unknown provider '{provider_name}'",
                        spec.name
                    ))
                })?;
                agents.push(Agent::new(member.agent.clone(), provider));
                policy.insert(
                    id,
                    MemberRule {
                        mode: member.mode,
                        depends_on: member.depends_on.clone(),
                    },
                );
            }

            match &spec.emits {
                EmitSpec::Artifacts => {}
                EmitSpec::Recommendations { from_agent } | EmitSpec::ActionPlan { from_agent } => {
                    if !ids.contains(from_agent.as_str()) {
                        return Err(AppError::Pipeline(format!(
                            "stage '{}' emits from unknown agent '{from_agent}'",
                            spec.name
                        )));
                    }
                }
            }
            if matches!(spec.emits, EmitSpec::Recommendations { .. }) {
                recommendations_seen = true;
            }

            let crew = Crew::new(&spec.name, agents, workflow.agent_timeout());
            tracing::info!(
                stage = %spec.name,
                index,
                members = spec.members.len(),
                "Registered stage"
            );
            stages.push(Arc::new(Stage::new(spec.clone(), crew, policy)));
        }

        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&Arc<Stage>> {
        self.stages.get(index)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}
