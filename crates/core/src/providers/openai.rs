use crate::config::LlmConfig;
use crate::error::CollectError;
use crate::providers::error_body;
use crate::traits::CompletionModel;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PROVIDER: &str = "llm";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions against an OpenAI-compatible endpoint.
pub struct OpenAiCompletion {
    client: Client,
    config: LlmConfig,
}

impl OpenAiCompletion {
    pub fn new(config: LlmConfig) -> Result<Self, CollectError> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CollectError> {
        let request = ChatRequest {
            model: self.config.model_name(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
        };

        debug!(model = %self.config.model, prompt_chars = prompt.len(), "chat completion");

        let response = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollectError::provider(PROVIDER, error_body(response).await));
        }

        let payload: ChatResponse = response.json().await?;
        reply_content(payload)
    }
}

fn reply_content(payload: ChatResponse) -> Result<String, CollectError> {
    payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| CollectError::provider(PROVIDER, "completion has no content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_content_takes_first_choice() {
        let payload: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": "[\"a\"]"}}]}"#,
        )
        .unwrap();
        assert_eq!(reply_content(payload).unwrap(), "[\"a\"]");
    }

    #[test]
    fn empty_completion_is_a_provider_error() {
        let payload: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            reply_content(payload),
            Err(CollectError::Provider { .. })
        ));
    }

    #[test]
    fn request_omits_missing_temperature() {
        let request = ChatRequest {
            model: "gpt-4.1",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn client_requires_api_key() {
        assert!(OpenAiCompletion::new(LlmConfig::default()).is_err());
    }
}
