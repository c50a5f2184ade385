use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::service::{schema_instructions, TextGenerator};

/// Text generator that shells out to the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCliGenerator {
    pub model: String,
    /// Executable to run. Overridable so tests can point at a stub.
    pub program: String,
}

impl ClaudeCliGenerator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            program: "claude".to_string(),
        }
    }
}

impl Default for ClaudeCliGenerator {
    fn default() -> Self {
        Self::new("claude-3-5-haiku-latest")
    }
}

#[async_trait]
impl TextGenerator for ClaudeCliGenerator {
    fn name(&self) -> &str {
        "claude_cli"
    }

    async fn generate(
        &self,
        system_prompt: &str,
        prompt: &str,
        schema: &Value,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        debug!(model = %self.model, "Invoking claude CLI");
        let system_prompt = format!("{system_prompt}\n\n{}", schema_instructions(schema));

        let result = tokio::time::timeout(timeout, async {
            Command::new(&self.program)
                .args([
                    "-p",
                    prompt,
                    "--system-prompt",
                    &system_prompt,
                    "--model",
                    &self.model,
                    "--output-format",
                    "text",
                ])
                .kill_on_drop(true)
                .output()
                .await
        })
        .await
        .map_err(|_| AgentError::Timeout(timeout.as_secs()))?
        .map_err(|e| AgentError::Transport(format!("Failed to spawn {}: {e}", self.program)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            warn!(status = %result.status, stderr = %stderr, "Claude CLI failed");
            return Err(AgentError::Transport(format!(
                "{} exited {}: {}",
                self.program, result.status, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&result.stdout).to_string();
        if stdout.trim().is_empty() {
            return Err(AgentError::Transport(
                "Claude returned empty response".to_string(),
            ));
        }

        Ok(stdout)
    }
}

/// Check if the `claude` CLI is available on the system.
pub async fn check_cli_available() -> bool {
    match Command::new("claude").arg("--version").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
