//! Deterministic stand-ins for the remote services, for use in tests.
//!
//! `ScriptedGenerator` replays a fixed list of replies; `CitingGenerator`
//! answers every request by citing all offered memories, which lets
//! multi-day simulations run without a model. `FlakyEmbedder` fails or
//! stalls on chosen texts to exercise the degraded paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use finmem_models::{Tier, TradeAction};
use serde_json::{json, Value};

use crate::embedding::{Embedder, HashingEmbedder};
use crate::error::AgentError;
use crate::service::TextGenerator;

/// One canned backend outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    Timeout,
    Transport(String),
    /// The service refused the request outright, e.g. a bad API key.
    Rejected(String),
    /// Never answers, ignoring the requested timeout.
    Hang,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text(text.into())
    }

    fn into_result(self, timeout: Duration) -> Result<String, AgentError> {
        match self {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Timeout => Err(AgentError::Timeout(timeout.as_secs())),
            ScriptedReply::Transport(msg) => Err(AgentError::Transport(msg)),
            ScriptedReply::Rejected(msg) => Err(AgentError::Config(msg)),
            ScriptedReply::Hang => Err(AgentError::Transport("hung reply resolved".to_string())),
        }
    }
}

/// Replays queued replies in order, then repeats `fallback` forever.
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    schemas: Mutex<Vec<Value>>,
}

impl ScriptedGenerator {
    pub fn sequence(replies: Vec<ScriptedReply>, fallback: ScriptedReply) -> Self {
        Self {
            queue: Mutex::new(replies.into()),
            fallback,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            schemas: Mutex::new(Vec::new()),
        }
    }

    pub fn always(reply: ScriptedReply) -> Self {
        Self::sequence(Vec::new(), reply)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn last_schema(&self) -> Option<Value> {
        self.schemas.lock().ok().and_then(|s| s.last().cloned())
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        prompt: &str,
        schema: &Value,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Ok(mut schemas) = self.schemas.lock() {
            schemas.push(schema.clone());
        }
        let next = self
            .queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        if next == ScriptedReply::Hang {
            std::future::pending::<()>().await;
        }
        next.into_result(timeout)
    }
}

/// Cites every offered memory and returns a fixed action.
pub struct CitingGenerator {
    pub action: TradeAction,
    pub rationale: String,
    calls: AtomicUsize,
}

impl CitingGenerator {
    pub fn new(action: TradeAction, rationale: impl Into<String>) -> Self {
        Self {
            action,
            rationale: rationale.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for CitingGenerator {
    fn name(&self) -> &str {
        "citing"
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        _prompt: &str,
        schema: &Value,
        _timeout: Duration,
    ) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let properties = &schema["properties"];
        let mut response = json!({"summary_reason": self.rationale});
        if properties.get("investment_decision").is_some() {
            response["investment_decision"] = json!(self.action.as_str());
        }
        for tier in Tier::ALL {
            let field = tier.citation_field();
            if let Some(offered) = properties[field]["items"]["enum"].as_array() {
                response[field] = Value::Array(offered.clone());
            }
        }
        Ok(response.to_string())
    }
}

/// Hashing embedder that fails for any text containing one of `fail_on`,
/// or never answers for those texts when built with [`FlakyEmbedder::stalling`].
pub struct FlakyEmbedder {
    inner: HashingEmbedder,
    fail_on: Vec<String>,
    stall: bool,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(dimensions: usize, fail_on: Vec<String>) -> Self {
        Self {
            inner: HashingEmbedder::new(dimensions),
            fail_on,
            stall: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn stalling(dimensions: usize, stall_on: Vec<String>) -> Self {
        Self {
            stall: true,
            ..Self::new(dimensions, stall_on)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.iter().any(|marker| text.contains(marker.as_str())) {
            if self.stall {
                std::future::pending::<()>().await;
            }
            return Err(AgentError::Embedding(format!(
                "scripted failure for {:?}",
                text.chars().take(32).collect::<String>()
            )));
        }
        self.inner.embed(text).await
    }
}
