use std::time::Duration;

use async_trait::async_trait;
use finmem_models::GeneratorConfig;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::service::{schema_instructions, TextGenerator};

/// Text generator for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatGenerator {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    json_mode: bool,
    temperature: f64,
    max_tokens: u32,
}

impl OpenAiChatGenerator {
    pub fn new(config: &GeneratorConfig, api_key: String) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            json_mode: config.json_mode,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Build from config, reading the API key from the configured env var.
    pub fn from_env(config: &GeneratorConfig) -> Result<Self, AgentError> {
        let api_key = api_key_from_env(&config.api_key_env)?;
        Self::new(config, api_key)
    }

    fn request_body(&self, system_prompt: &str, prompt: &str, schema: &Value) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                {
                    "role": "system",
                    "content": format!("{system_prompt}\n\n{}", schema_instructions(schema)),
                },
                {"role": "user", "content": prompt},
            ],
        });
        if self.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl TextGenerator for OpenAiChatGenerator {
    fn name(&self) -> &str {
        "openai_chat"
    }

    async fn generate(
        &self,
        system_prompt: &str,
        prompt: &str,
        schema: &Value,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(model = %self.model, %url, "Requesting chat completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&self.request_body(system_prompt, prompt, schema))
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "Chat completion failed");
            return Err(status_error(status, &text, AgentError::Transport));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        extract_message_content(&body)
    }
}

/// Pull the first choice's message text out of a chat completion body.
pub fn extract_message_content(body: &Value) -> Result<String, AgentError> {
    match body["choices"][0]["message"]["content"].as_str() {
        Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
        _ => Err(AgentError::Transport(
            "Chat completion contained no message content".to_string(),
        )),
    }
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(timeout.as_secs())
    } else {
        AgentError::Transport(e.to_string())
    }
}

/// Classify a non-success status. Client errors other than 408 and 429 mean
/// the request itself is wrong (bad key, unknown model) and will not succeed
/// on retry; everything else is reported through `retryable`.
pub(crate) fn status_error(
    status: StatusCode,
    body: &str,
    retryable: fn(String) -> AgentError,
) -> AgentError {
    let message = format!("HTTP {status}: {body}");
    let rejected = status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS;
    if rejected {
        AgentError::Config(message)
    } else {
        retryable(message)
    }
}

pub(crate) fn api_key_from_env(var: &str) -> Result<String, AgentError> {
    std::env::var(var).map_err(|_| AgentError::Config(format!("{var} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(json_mode: bool) -> OpenAiChatGenerator {
        let config = GeneratorConfig {
            api_base: "http://localhost:8080/v1/".to_string(),
            model: "gpt-4o-mini".to_string(),
            json_mode,
            ..GeneratorConfig::default()
        };
        OpenAiChatGenerator::new(&config, "key".to_string()).unwrap()
    }

    #[test]
    fn request_body_uses_json_mode() {
        let gen = generator(true);
        let body = gen.request_body("sys", "user", &json!({"type": "object"}));
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][1]["content"], "user");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("JSON schema"));
        assert_eq!(gen.api_base, "http://localhost:8080/v1");
    }

    #[test]
    fn request_body_without_json_mode() {
        let body = generator(false).request_body("sys", "user", &json!({}));
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn client_errors_are_configuration_errors() {
        for code in [400, 401, 403, 404] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = status_error(status, "denied", AgentError::Transport);
            assert!(matches!(err, AgentError::Config(_)), "{code}: {err}");
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn throttling_and_server_errors_stay_retryable() {
        for code in [408, 429, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = status_error(status, "busy", AgentError::Transport);
            assert!(matches!(err, AgentError::Transport(_)), "{code}: {err}");
            assert!(err.is_transient());
        }
        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "", AgentError::Embedding);
        assert!(matches!(err, AgentError::Embedding(_)));
    }

    #[test]
    fn message_content_extraction() {
        let body = json!({"choices": [{"message": {"content": "{\"a\": 1}"}}]});
        assert_eq!(extract_message_content(&body).unwrap(), "{\"a\": 1}");

        let empty = json!({"choices": []});
        assert!(matches!(
            extract_message_content(&empty),
            Err(AgentError::Transport(_))
        ));
    }
}
