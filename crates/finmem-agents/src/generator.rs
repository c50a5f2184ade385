use std::sync::Arc;
use std::time::{Duration, Instant};

use finmem_models::{Decision, DecisionStatus, GeneratorConfig, RunMode, TradeAction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembler::DecisionContext;
use crate::error::AgentError;
use crate::parser::{parse_strict, repair, ParsedDecision};
use crate::prompts::{decision_schema, decision_system_prompt, format_decision_prompt};
use crate::service::TextGenerator;

/// Retry and timeout bounds applied around every generation request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardPolicy {
    pub request_timeout: Duration,
    /// Total transport attempts, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl GuardPolicy {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self::from_config(&GeneratorConfig::default())
    }
}

/// Lifecycle of one guarded generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationState {
    Pending,
    Requested { attempt: u32 },
    Validated(ParsedDecision),
    Repaired(ParsedDecision),
    Failed { reason: String },
}

impl GenerationState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::Validated(_)
                | GenerationState::Repaired(_)
                | GenerationState::Failed { .. }
        )
    }
}

/// Wraps a [`TextGenerator`] with bounded retries, strict validation and a
/// single structural repair.
///
/// Every request is cut off at `request_timeout`, whether or not the backend
/// enforces it. Anything unusable becomes a `Failed` decision; only
/// configuration errors (a rejected key, an unknown model) are returned.
pub struct GuardedGenerator {
    backend: Arc<dyn TextGenerator>,
    policy: GuardPolicy,
    mode: RunMode,
    character: String,
}

impl GuardedGenerator {
    pub fn new(
        backend: Arc<dyn TextGenerator>,
        policy: GuardPolicy,
        mode: RunMode,
        character: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            policy,
            mode,
            character: character.into(),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Produce a decision for `context`.
    pub async fn generate(&self, context: &DecisionContext) -> Result<Decision, AgentError> {
        let start = Instant::now();
        let system_prompt = decision_system_prompt(self.mode, &self.character);
        let prompt = format_decision_prompt(self.mode, context);
        let schema = decision_schema(self.mode, context);

        let mut state = GenerationState::Pending;
        while !state.is_terminal() {
            state = match state {
                GenerationState::Pending => GenerationState::Requested { attempt: 1 },
                GenerationState::Requested { attempt } => {
                    debug!(symbol = %context.symbol, attempt, backend = self.backend.name(), "Requesting decision");
                    match self.request(&system_prompt, &prompt, &schema).await {
                        Ok(raw) => self.validate(context, &raw),
                        Err(e @ AgentError::Config(_)) => {
                            warn!(symbol = %context.symbol, error = %e, "Generation backend rejected the configuration");
                            return Err(e);
                        }
                        Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                            warn!(
                                symbol = %context.symbol,
                                attempt,
                                max_attempts = self.policy.max_attempts,
                                error = %e,
                                "Generation request failed, retrying"
                            );
                            tokio::time::sleep(self.policy.retry_delay).await;
                            GenerationState::Requested {
                                attempt: attempt + 1,
                            }
                        }
                        Err(e) => GenerationState::Failed {
                            reason: format!("generation failed after {attempt} attempt(s): {e}"),
                        },
                    }
                }
                terminal => terminal,
            };
        }

        let decision = self.finish(context, state);
        match &decision.status {
            DecisionStatus::Failed { reason } => warn!(
                symbol = %context.symbol,
                day = context.day,
                reason = %reason,
                elapsed_ms = start.elapsed().as_millis(),
                "Decision generation failed, defaulting to hold"
            ),
            status => info!(
                symbol = %context.symbol,
                day = context.day,
                action = decision.action.as_str(),
                status = ?status,
                cited = decision.cited_count(),
                elapsed_ms = start.elapsed().as_millis(),
                "Decision generated"
            ),
        }
        Ok(decision)
    }

    async fn request(
        &self,
        system_prompt: &str,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<String, AgentError> {
        let timeout = self.policy.request_timeout;
        tokio::time::timeout(
            timeout,
            self.backend.generate(system_prompt, prompt, schema, timeout),
        )
        .await
        .map_err(|_| AgentError::Timeout(timeout.as_secs()))?
    }

    fn validate(&self, context: &DecisionContext, raw: &str) -> GenerationState {
        match parse_strict(raw, self.mode, &context.citations) {
            Ok(parsed) => GenerationState::Validated(parsed),
            Err(strict_err) => {
                debug!(symbol = %context.symbol, error = %strict_err, "Strict parse failed, repairing");
                match repair(raw, self.mode, &context.citations) {
                    Ok(parsed) => {
                        warn!(symbol = %context.symbol, error = %strict_err, "Decision response repaired");
                        GenerationState::Repaired(parsed)
                    }
                    Err(repair_err) => GenerationState::Failed {
                        reason: format!("unusable response: {repair_err}"),
                    },
                }
            }
        }
    }

    fn finish(&self, context: &DecisionContext, state: GenerationState) -> Decision {
        let (parsed, status) = match state {
            GenerationState::Validated(parsed) => (parsed, DecisionStatus::Validated),
            GenerationState::Repaired(parsed) => (parsed, DecisionStatus::Repaired),
            GenerationState::Failed { reason } => {
                return Decision::failed(&context.symbol, context.day, reason);
            }
            GenerationState::Pending | GenerationState::Requested { .. } => {
                return Decision::failed(&context.symbol, context.day, "generation did not finish");
            }
        };

        let action = match (self.mode, parsed.action) {
            (RunMode::Test, Some(action)) => action,
            (RunMode::Test, None) => TradeAction::Hold,
            (RunMode::Warmup, _) => context
                .future_return
                .map(TradeAction::from_return)
                .unwrap_or(TradeAction::Hold),
        };

        Decision {
            id: Uuid::new_v4(),
            symbol: context.symbol.clone(),
            day: context.day,
            action,
            rationale: parsed.rationale,
            citations: parsed.citations,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{CitationTable, PromptMemory};
    use crate::test_support::{ScriptedGenerator, ScriptedReply};
    use chrono::NaiveDate;
    use finmem_models::{MemoryId, Tier};
    use rust_decimal_macros::dec;

    fn fast_policy() -> GuardPolicy {
        GuardPolicy {
            request_timeout: Duration::from_secs(1),
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        }
    }

    fn context() -> DecisionContext {
        let mut citations = CitationTable::new();
        let memory_index = citations.push(Tier::Short, MemoryId(9));
        DecisionContext {
            symbol: "AAPL".to_string(),
            day: 2,
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            price: dec!(179.66),
            momentum: None,
            news: vec![],
            future_return: Some(-0.01),
            memories: vec![PromptMemory {
                memory_index,
                tier: Tier::Short,
                id: MemoryId(9),
                text: "Vision Pro launch".to_string(),
                score: 2.0,
            }],
            citations,
        }
    }

    fn guarded(backend: Arc<ScriptedGenerator>, mode: RunMode) -> GuardedGenerator {
        GuardedGenerator::new(backend, fast_policy(), mode, "trader")
    }

    #[tokio::test]
    async fn valid_response_is_validated() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::text(
            r#"{"investment_decision": "sell", "summary_reason": "Weak demand", "short_memory_ids": [0]}"#,
        )));
        let decision = guarded(backend.clone(), RunMode::Test).generate(&context()).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Validated);
        assert_eq!(decision.action, TradeAction::Sell);
        assert_eq!(decision.citations[&Tier::Short], vec![0]);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_response_is_repaired_once() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::text(
            "My answer:\n{\"decision\": \"Hold\", \"summary\": \"Mixed signals\", \"short_memory_ids\": [\"0\", 5]}",
        )));
        let decision = guarded(backend.clone(), RunMode::Test).generate(&context()).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Repaired);
        assert_eq!(decision.action, TradeAction::Hold);
        assert!(!decision.is_failed());
        assert_eq!(decision.citations[&Tier::Short], vec![0]);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn unrepairable_response_fails_without_retry() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::text(
            "I cannot decide today.",
        )));
        let decision = guarded(backend.clone(), RunMode::Test).generate(&context()).await.unwrap();
        assert!(decision.is_failed());
        assert_eq!(decision.action, TradeAction::Hold);
        assert!(decision.citations.is_empty());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_retried_then_fail() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::Timeout));
        let decision = guarded(backend.clone(), RunMode::Test).generate(&context()).await.unwrap();
        assert!(decision.is_failed());
        assert!(decision.citations.is_empty());
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_error() {
        let backend = Arc::new(ScriptedGenerator::sequence(
            vec![
                ScriptedReply::Transport("connection reset".to_string()),
                ScriptedReply::text(r#"{"investment_decision": "buy", "summary_reason": "Rebound"}"#),
            ],
            ScriptedReply::Timeout,
        ));
        let decision = guarded(backend.clone(), RunMode::Test).generate(&context()).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Validated);
        assert_eq!(decision.action, TradeAction::Buy);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn warmup_action_follows_realised_return() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::text(
            r#"{"summary_reason": "Product delays weighed on the stock", "short_memory_ids": [0]}"#,
        )));
        let decision = guarded(backend, RunMode::Warmup).generate(&context()).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Validated);
        assert_eq!(decision.action, TradeAction::Sell);
    }

    #[tokio::test]
    async fn backend_that_never_answers_is_cut_off() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::Hang));
        let policy = GuardPolicy {
            request_timeout: Duration::from_millis(50),
            ..fast_policy()
        };
        let guarded = GuardedGenerator::new(backend.clone(), policy, RunMode::Test, "trader");
        let decision = tokio::time::timeout(Duration::from_secs(2), guarded.generate(&context()))
            .await
            .expect("guard must return before the outer deadline")
            .unwrap();
        assert!(decision.is_failed());
        assert_eq!(decision.action, TradeAction::Hold);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn configuration_errors_are_returned_without_retry() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::Rejected(
            "HTTP 401 Unauthorized".to_string(),
        )));
        let err = guarded(backend.clone(), RunMode::Test)
            .generate(&context())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn backend_receives_schema_with_offered_indices() {
        let backend = Arc::new(ScriptedGenerator::always(ScriptedReply::text(
            r#"{"investment_decision": "hold", "summary_reason": "x"}"#,
        )));
        guarded(backend.clone(), RunMode::Test).generate(&context()).await.unwrap();
        let schema = backend.last_schema().unwrap();
        assert_eq!(
            schema["properties"]["short_memory_ids"]["items"]["enum"],
            serde_json::json!([0])
        );
    }
}
