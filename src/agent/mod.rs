pub mod prompt;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FailureCause, ProviderError};
use crate::provider::{CompletionRequest, ThrottledProvider};
use schema::Schema;

/// Declarative agent configuration: persona, contracts, and provider binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub instructions: String,
    /// Provider name; the workflow default is used when unset.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "Schema::any")]
    pub input_schema: Schema,
    pub output_schema: Schema,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Upper bound on the caller-supplied timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_schema_version() -> u32 {
    1
}

/// Validated result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub schema_version: u32,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// An agent resolved against its provider, ready to invoke.
pub struct Agent {
    spec: AgentSpec,
    provider: Arc<ThrottledProvider>,
}

impl Agent {
    pub fn new(spec: AgentSpec, provider: Arc<ThrottledProvider>) -> Self {
        Self { spec, provider }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn role(&self) -> &str {
        &self.spec.role
    }

    fn effective_timeout(&self, timeout: Duration) -> Duration {
        match self.spec.timeout_secs {
            Some(secs) => timeout.min(Duration::from_secs(secs)),
            None => timeout,
        }
    }

    /// Run one bounded inference over `input`.
    ///
    /// The input is checked before the provider is called and the payload is
    /// checked after; neither is ever coerced.
    pub async fn invoke(
        &self,
        input: &serde_json::Value,
        timeout: Duration,
    ) -> Result<AgentOutput, FailureCause> {
        let agent = self.spec.id.as_str();

        if let Err(reason) = self.spec.input_schema.validate(input) {
            tracing::warn!(agent, reason = %reason, "Agent input rejected");
            return Err(FailureCause::InvalidInput {
                agent: agent.to_string(),
                reason,
            });
        }

        let request = CompletionRequest {
            system: prompt::system_prompt(&self.spec),
            prompt: prompt::task_prompt(&self.spec, input),
            schema: self.spec.output_schema.to_json_schema(),
            timeout: self.effective_timeout(timeout),
        };

        tracing::info!(agent, role = %self.spec.role, provider = self.provider.name(), "Invoking agent");

        let payload = match self.provider.complete(&request).await {
            Ok(payload) => payload,
            Err(ProviderError::Unavailable(reason)) => {
                tracing::warn!(agent, reason = %reason, "Provider unavailable");
                return Err(FailureCause::ProviderUnavailable {
                    agent: agent.to_string(),
                    reason,
                });
            }
            Err(ProviderError::RateLimited(reason)) => {
                tracing::warn!(agent, reason = %reason, "Provider rate limited");
                return Err(FailureCause::RateLimited {
                    agent: agent.to_string(),
                    reason,
                });
            }
        };

        if let Err(reason) = self.spec.output_schema.validate(&payload) {
            tracing::warn!(agent, reason = %reason, "Agent output violates schema");
            return Err(FailureCause::SchemaViolation {
                agent: agent.to_string(),
                reason,
            });
        }

        let confidence = payload
            .get("confidence")
            .and_then(serde_json::Value::as_f64)
            .map(|c| c.clamp(0.0, 1.0));

        Ok(AgentOutput {
            agent_id: agent.to_string(),
            schema_version: self.spec.schema_version,
            payload,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::schema::{FieldKind, FieldSpec};
    use crate::testing::ScriptedProvider;
    use serde_json::json;

    fn risk_spec() -> AgentSpec {
        AgentSpec {
            id: "risk".to_string(),
            role: "Risk Analyst".to_string(),
            goal: String::new(),
            instructions: String::new(),
            provider: None,
            input_schema: Schema::new(vec![FieldSpec::required(
                "accountData",
                FieldKind::Object,
            )]),
            output_schema: Schema::new(vec![FieldSpec::required("risk", FieldKind::String)]),
            schema_version: 2,
            timeout_secs: None,
        }
    }

    fn agent_with(provider: Arc<ScriptedProvider>) -> Agent {
        Agent::new(risk_spec(), Arc::new(ThrottledProvider::new(provider, 1)))
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let provider = Arc::new(ScriptedProvider::new("mock"));
        provider.push_ok(json!({"risk": "medium", "confidence": 0.7}));
        let agent = agent_with(provider.clone());

        let output = agent
            .invoke(&json!({"accountData": {"name": "Acme"}}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.agent_id, "risk");
        assert_eq!(output.schema_version, 2);
        assert_eq!(output.payload["risk"], "medium");
        assert_eq!(output.confidence, Some(0.7));
    }

    #[tokio::test]
    async fn test_invalid_input_never_calls_provider() {
        let provider = Arc::new(ScriptedProvider::new("mock"));
        provider.push_ok(json!({"risk": "low"}));
        let agent = agent_with(provider.clone());

        let err = agent
            .invoke(&json!({"other": 1}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FailureCause::InvalidInput { .. }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_schema_violation_not_coerced() {
        let provider = Arc::new(ScriptedProvider::new("mock"));
        provider.push_ok(json!({"risk": 5}));
        let agent = agent_with(provider);

        let err = agent
            .invoke(&json!({"accountData": {}}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FailureCause::SchemaViolation { agent, .. } if agent == "risk"));
    }

    #[tokio::test]
    async fn test_provider_errors_mapped() {
        let provider = Arc::new(ScriptedProvider::new("mock"));
        provider.push_err(ProviderError::Unavailable("503".to_string()));
        provider.push_err(ProviderError::RateLimited("429".to_string()));
        let agent = agent_with(provider);
        let input = json!({"accountData": {}});

        let first = agent.invoke(&input, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(first, FailureCause::ProviderUnavailable { .. }));
        let second = agent.invoke(&input, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(second, FailureCause::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_provider_unavailable() {
        let provider = Arc::new(
            ScriptedProvider::new("mock").with_delay(Duration::from_millis(200)),
        );
        provider.push_ok(json!({"risk": "low"}));
        let agent = agent_with(provider);

        let err = agent
            .invoke(&json!({"accountData": {}}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, FailureCause::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_confidence_clamped() {
        let provider = Arc::new(ScriptedProvider::new("mock"));
        provider.push_ok(json!({"risk": "high", "confidence": 1.8}));
        provider.push_ok(json!({"risk": "high", "confidence": -3}));
        let agent = agent_with(provider);
        let input = json!({"accountData": {}});

        let high = agent.invoke(&input, Duration::from_secs(5)).await.unwrap();
        assert_eq!(high.confidence, Some(1.0));
        let low = agent.invoke(&input, Duration::from_secs(5)).await.unwrap();
        assert_eq!(low.confidence, Some(0.0));
    }

    #[test]
    fn test_agent_timeout_caps_caller_timeout() {
        let mut spec = risk_spec();
        spec.timeout_secs = Some(2);
        let agent = Agent::new(
            spec,
            Arc::new(ThrottledProvider::new(Arc::new(ScriptedProvider::new("m")), 1)),
        );
        assert_eq!(
            agent.effective_timeout(Duration::from_secs(30)),
            Duration::from_secs(2)
        );
        assert_eq!(
            agent.effective_timeout(Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
