use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::provider::{CapabilityProvider, CompletionRequest};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Name of the single tool the model is forced to call with its result.
const RESULT_TOOL: &str = "submit_result";

pub struct AnthropicProvider {
    name: String,
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(
        name: &str,
        api_key: &str,
        model: &str,
        max_tokens: u32,
        base_url: Option<&str>,
    ) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
            base_url: base_url
                .unwrap_or(ANTHROPIC_API_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &self,
        request: &MessagesRequest,
        timeout: std::time::Duration,
    ) -> Result<MessagesResponse, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unavailable(format!(
                "API returned {status}: {body}"
            )));
        }

        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed response: {e}")))
    }
}

#[async_trait]
impl CapabilityProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<serde_json::Value, ProviderError> {
        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: request.system.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: MessageContent::Text(request.prompt.clone()),
            }],
            tools: vec![ToolDefinition {
                name: RESULT_TOOL.to_string(),
                description: "Submit the final structured result of the task.".to_string(),
                input_schema: request.schema.clone(),
            }],
            tool_choice: ToolChoice {
                choice_type: "tool".to_string(),
                name: RESULT_TOOL.to_string(),
            },
        };

        let response = self.send_message(&body, request.timeout).await?;

        tracing::debug!(
            provider = %self.name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            stop_reason = ?response.stop_reason,
            "Anthropic response"
        );

        extract_tool_input(&response.content).ok_or_else(|| {
            ProviderError::Unavailable(format!(
                "response did not call {RESULT_TOOL} (stop_reason: {})",
                response.stop_reason.as_deref().unwrap_or("unknown")
            ))
        })
    }
}

fn extract_tool_input(content: &[ContentBlock]) -> Option<serde_json::Value> {
    content.iter().find_map(|block| match block {
        ContentBlock::ToolUse { name, input, .. } if name == RESULT_TOOL => Some(input.clone()),
        _ => None,
    })
}

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolChoice {
    #[serde(rename = "type")]
    pub choice_type: String,
    pub name: String,
}

// --- Response types ---

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
