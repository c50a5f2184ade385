use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use finmem_memory::{MemoryEngine, SweepReport, SymbolMemory};
use finmem_models::{Day, DayInput, DayReport, Decision, EmbeddingConfig, ReflectionOutcome, Tier};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::assembler::{Assembler, DecisionContext};
use crate::embedding::Embedder;
use crate::error::AgentError;
use crate::generator::GuardedGenerator;
use crate::reflection::{reflection_text, ReflectionPolicy};

/// Everything one simulated day produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayOutcome {
    pub day: Day,
    /// One report per symbol, ordered by symbol.
    pub reports: Vec<DayReport>,
    pub sweep: SweepReport,
}

/// Runs the daily decision cycle for every symbol.
///
/// Each symbol is processed in its own task, which owns that symbol's memory
/// for the day. The engine-wide sweep runs once after all tasks have joined.
/// Embedding calls are cut off at `embed_timeout` and then treated like any
/// other transient embedding failure.
#[derive(Clone)]
pub struct DecisionCycle {
    assembler: Arc<Assembler>,
    generator: Arc<GuardedGenerator>,
    embedder: Arc<dyn Embedder>,
    reflection: Arc<dyn ReflectionPolicy>,
    embed_timeout: Duration,
}

impl DecisionCycle {
    pub fn new(
        assembler: Assembler,
        generator: GuardedGenerator,
        embedder: Arc<dyn Embedder>,
        reflection: Arc<dyn ReflectionPolicy>,
    ) -> Self {
        Self {
            assembler: Arc::new(assembler),
            generator: Arc::new(generator),
            embedder,
            reflection,
            embed_timeout: Duration::from_secs(EmbeddingConfig::default().timeout_seconds),
        }
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// Run one day for every symbol in `inputs`, then sweep the engine.
    ///
    /// Degraded service calls never abort the day. Memory invariant and
    /// configuration errors do: every checked-out symbol is returned to the
    /// engine and the error is surfaced without sweeping.
    pub async fn run_day(
        &self,
        engine: &mut MemoryEngine,
        day: Day,
        inputs: Vec<DayInput>,
    ) -> Result<DayOutcome, AgentError> {
        let start = Instant::now();
        let mut symbols = BTreeSet::new();
        for input in &inputs {
            if input.day != day {
                return Err(AgentError::Config(format!(
                    "input for {} is dated day {}, expected {day}",
                    input.observation.symbol, input.day
                )));
            }
            if !symbols.insert(input.observation.symbol.clone()) {
                return Err(AgentError::Config(format!(
                    "{} appears twice on day {day}",
                    input.observation.symbol
                )));
            }
        }

        let mut checked_out = Vec::with_capacity(inputs.len());
        for input in inputs {
            match engine.take_symbol(&input.observation.symbol) {
                Ok(memory) => checked_out.push((memory, input)),
                Err(e) => {
                    for (memory, _) in checked_out {
                        engine.return_symbol(memory)?;
                    }
                    return Err(e.into());
                }
            }
        }

        let mut tasks = JoinSet::new();
        for (mut memory, input) in checked_out {
            let cycle = self.clone();
            tasks.spawn(async move {
                let result = cycle.run_symbol(&mut memory, &input).await;
                (memory, result)
            });
        }

        let mut reports = Vec::new();
        let mut first_error: Option<AgentError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((memory, result)) => {
                    let symbol = memory.symbol().to_string();
                    engine.return_symbol(memory)?;
                    match result {
                        Ok(report) => reports.push(report),
                        Err(e) => {
                            error!(symbol = %symbol, day, error = %e, "Symbol cycle failed");
                            first_error.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    error!(day, error = %e, "Symbol task panicked");
                    first_error.get_or_insert(AgentError::Task(e.to_string()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let sweep = engine.sweep(day)?;
        reports.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        info!(
            day,
            symbols = reports.len(),
            failed = reports.iter().filter(|r| r.decision.is_failed()).count(),
            elapsed_ms = start.elapsed().as_millis(),
            "Day complete"
        );
        Ok(DayOutcome {
            day,
            reports,
            sweep,
        })
    }

    /// Steps 1-5 of the cycle for a single symbol.
    pub async fn run_symbol(
        &self,
        memory: &mut SymbolMemory,
        input: &DayInput,
    ) -> Result<DayReport, AgentError> {
        let symbol = input.observation.symbol.clone();
        let day = input.day;
        let mode = self.assembler.mode();

        let query = self.embed(&self.assembler.query_text(&symbol)).await;
        let (context, decision) = match query {
            Ok(query) => {
                let context = self.assembler.assemble(memory, input, &query)?;
                let decision = self.generator.generate(&context).await?;
                (context, decision)
            }
            Err(e) if e.is_transient() => {
                warn!(symbol = %symbol, day, error = %e, "Query embedding failed, skipping generation");
                let context = DecisionContext::without_memories(input, mode);
                let decision =
                    Decision::failed(&symbol, day, format!("query embedding failed: {e}"));
                (context, decision)
            }
            Err(e) => return Err(e),
        };

        let cited_memory_ids = if decision.is_failed() {
            BTreeMap::new()
        } else {
            let cited = context.citations.resolve_all(&decision.citations);
            for (tier, ids) in &cited {
                memory.reinforce(*tier, ids, day)?;
            }
            cited
        };

        let mut memories_added = 0;
        for (tier, text) in observation_memories(input) {
            match self.embed(&text).await {
                Ok(embedding) => {
                    if memory.insert(tier, &text, embedding, day)?.is_some() {
                        memories_added += 1;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(symbol = %symbol, day, %tier, error = %e, "Memory embedding failed, skipping memory");
                }
                Err(e) => return Err(e),
            }
        }

        let reflection = self.reflect(memory, input, &decision, &context).await?;

        Ok(DayReport {
            symbol,
            day,
            date: input.observation.date,
            decision,
            cited_memory_ids,
            memories_added,
            reflection,
            realised_return: input.future_return,
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        tokio::time::timeout(self.embed_timeout, self.embedder.embed(text))
            .await
            .map_err(|_| AgentError::Timeout(self.embed_timeout.as_secs()))?
    }

    async fn reflect(
        &self,
        memory: &mut SymbolMemory,
        input: &DayInput,
        decision: &Decision,
        context: &DecisionContext,
    ) -> Result<ReflectionOutcome, AgentError> {
        if !self.reflection.should_reflect(input) {
            return Ok(ReflectionOutcome::NotScheduled);
        }
        if decision.is_failed() {
            return Ok(ReflectionOutcome::Skipped {
                reason: "decision failed".to_string(),
            });
        }
        let Some(text) = reflection_text(decision, context) else {
            return Ok(ReflectionOutcome::Skipped {
                reason: "nothing to reflect on".to_string(),
            });
        };

        let embedding = match self.embed(&text).await {
            Ok(embedding) => embedding,
            Err(e) if e.is_transient() => {
                warn!(symbol = %decision.symbol, day = decision.day, error = %e, "Reflection embedding failed");
                return Ok(ReflectionOutcome::Skipped {
                    reason: format!("embedding failed: {e}"),
                });
            }
            Err(e) => return Err(e),
        };

        Ok(
            match memory.insert(Tier::Reflection, &text, embedding, input.day)? {
                Some(id) => ReflectionOutcome::Stored { id },
                None => ReflectionOutcome::Duplicate,
            },
        )
    }
}

/// Memories created from a day's raw observation: one short-term memory per
/// news item (or a price summary on quiet days), quarterly filings in the mid
/// tier and annual filings in the long tier.
pub fn observation_memories(input: &DayInput) -> Vec<(Tier, String)> {
    let obs = &input.observation;
    let mut memories: Vec<(Tier, String)> = obs
        .news
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| (Tier::Short, format!("{} {}: {item}", obs.date, obs.symbol)))
        .collect();

    if memories.is_empty() {
        let movement = match input.momentum {
            Some(m) => format!(
                ", {:+.2}% over the last {} day(s)",
                m.cumulative_return * 100.0,
                m.window
            ),
            None => String::new(),
        };
        memories.push((
            Tier::Short,
            format!("{} {} closed at {}{movement}.", obs.date, obs.symbol, obs.price),
        ));
    }
    if let Some(filing) = obs.quarterly_filing.as_deref().filter(|f| !f.trim().is_empty()) {
        memories.push((
            Tier::Mid,
            format!("{} {} quarterly filing: {}", obs.date, obs.symbol, filing.trim()),
        ));
    }
    if let Some(filing) = obs.annual_filing.as_deref().filter(|f| !f.trim().is_empty()) {
        memories.push((
            Tier::Long,
            format!("{} {} annual filing: {}", obs.date, obs.symbol, filing.trim()),
        ));
    }
    memories
}
