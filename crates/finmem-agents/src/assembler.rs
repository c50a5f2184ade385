use std::collections::BTreeMap;

use chrono::NaiveDate;
use finmem_memory::{MemoryError, SymbolMemory};
use finmem_models::{
    Day, DayInput, MemoryId, MemoryIndex, Momentum, RetrievalConfig, RunMode, Tier,
};
use rust_decimal::Decimal;
use tracing::debug;

/// Per-decision translation between prompt labels and storage ids.
///
/// Built fresh for every decision and discarded afterwards; a prompt index
/// means nothing outside the decision it was issued for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CitationTable {
    entries: BTreeMap<MemoryIndex, (Tier, MemoryId)>,
}

impl CitationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the next memory and return its prompt index.
    pub fn push(&mut self, tier: Tier, id: MemoryId) -> MemoryIndex {
        let index = self.entries.len();
        self.entries.insert(index, (tier, id));
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Storage id behind `index`, only if it was offered under `tier`.
    pub fn resolve(&self, tier: Tier, index: MemoryIndex) -> Option<MemoryId> {
        match self.entries.get(&index) {
            Some((offered, id)) if *offered == tier => Some(*id),
            _ => None,
        }
    }

    pub fn is_offered(&self, tier: Tier, index: MemoryIndex) -> bool {
        self.resolve(tier, index).is_some()
    }

    /// Indices offered under `tier`, ascending.
    pub fn offered(&self, tier: Tier) -> Vec<MemoryIndex> {
        self.entries
            .iter()
            .filter(|(_, (t, _))| *t == tier)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Translate cited prompt indices into storage ids, dropping any that
    /// were not offered under the tier they were cited for.
    pub fn resolve_all(
        &self,
        citations: &BTreeMap<Tier, Vec<MemoryIndex>>,
    ) -> BTreeMap<Tier, Vec<MemoryId>> {
        citations
            .iter()
            .map(|(tier, indices)| {
                let ids = indices
                    .iter()
                    .filter_map(|index| self.resolve(*tier, *index))
                    .collect::<Vec<_>>();
                (*tier, ids)
            })
            .filter(|(_, ids)| !ids.is_empty())
            .collect()
    }
}

/// One retrieved memory as shown in the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMemory {
    pub memory_index: MemoryIndex,
    pub tier: Tier,
    pub id: MemoryId,
    pub text: String,
    pub score: f64,
}

/// Everything the generator needs for one symbol on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionContext {
    pub symbol: String,
    pub day: Day,
    pub date: NaiveDate,
    pub price: Decimal,
    pub momentum: Option<Momentum>,
    pub news: Vec<String>,
    /// Only populated in warmup mode.
    pub future_return: Option<f64>,
    /// Retrieved memories in prompt order.
    pub memories: Vec<PromptMemory>,
    pub citations: CitationTable,
}

impl DecisionContext {
    /// Context with no retrieved memories.
    pub fn without_memories(input: &DayInput, mode: RunMode) -> Self {
        Self {
            symbol: input.observation.symbol.clone(),
            day: input.day,
            date: input.observation.date,
            price: input.observation.price,
            momentum: input.momentum,
            news: input.observation.news.clone(),
            future_return: match mode {
                RunMode::Warmup => input.future_return,
                RunMode::Test => None,
            },
            memories: Vec::new(),
            citations: CitationTable::new(),
        }
    }

    pub fn memories_in(&self, tier: Tier) -> impl Iterator<Item = &PromptMemory> {
        self.memories.iter().filter(move |m| m.tier == tier)
    }

    pub fn memory(&self, index: MemoryIndex) -> Option<&PromptMemory> {
        self.memories.iter().find(|m| m.memory_index == index)
    }
}

/// Builds the retrieval query and the per-day decision context.
#[derive(Debug, Clone)]
pub struct Assembler {
    retrieval: RetrievalConfig,
    mode: RunMode,
}

impl Assembler {
    pub fn new(retrieval: RetrievalConfig, mode: RunMode) -> Self {
        Self { retrieval, mode }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Tiers offered to the generator. Warmup explains realised moves and
    /// does not draw on earlier reflections.
    pub fn tiers(&self) -> &'static [Tier] {
        match self.mode {
            RunMode::Warmup => &Tier::LADDER,
            RunMode::Test => &Tier::ALL,
        }
    }

    /// Query text used to search every tier for `symbol`.
    pub fn query_text(&self, symbol: &str) -> String {
        format!("{} Key information for trading {symbol}.", self.retrieval.character)
    }

    /// Retrieve each tier's top memories and label them densely from 0 in
    /// tier order.
    pub fn assemble(
        &self,
        memory: &mut SymbolMemory,
        input: &DayInput,
        query: &[f32],
    ) -> Result<DecisionContext, MemoryError> {
        let mut context = DecisionContext::without_memories(input, self.mode);

        for tier in self.tiers() {
            let k = self.retrieval.top_k(*tier);
            for hit in memory.retrieve(*tier, query, input.day, k)? {
                let memory_index = context.citations.push(*tier, hit.record.id);
                context.memories.push(PromptMemory {
                    memory_index,
                    tier: *tier,
                    id: hit.record.id,
                    text: hit.record.text,
                    score: hit.score,
                });
            }
        }

        debug!(
            symbol = %context.symbol,
            day = context.day,
            memories = context.memories.len(),
            "Assembled decision context"
        );
        Ok(context)
    }
}
