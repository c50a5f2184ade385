use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgentError;

/// A text generation backend.
///
/// Implementations make exactly one request per call and never retry; the
/// [`crate::GuardedGenerator`] owns the retry and repair policy.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Send `prompt` with the expected response shape and return the raw text.
    async fn generate(
        &self,
        system_prompt: &str,
        prompt: &str,
        schema: &Value,
        timeout: Duration,
    ) -> Result<String, AgentError>;
}

/// Instructions telling the model to answer with a single JSON object of the
/// given shape. Shared by every backend that lacks native schema support.
pub fn schema_instructions(schema: &Value) -> String {
    let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "Respond with a single JSON object and nothing else. \
         It must match this JSON schema:\n{pretty}"
    )
}
