use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::{Day, MemoryId, Tier};

/// Prompt-local label of a retrieved memory. Unique within one prompt and
/// never equal in meaning to a storage id.
pub type MemoryIndex = usize;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Hold => "hold",
        }
    }

    /// Position direction implied by the action.
    pub fn direction(self) -> i8 {
        match self {
            TradeAction::Buy => 1,
            TradeAction::Sell => -1,
            TradeAction::Hold => 0,
        }
    }

    /// Action implied by a realised return (used while warming up).
    pub fn from_return(ret: f64) -> Self {
        if ret > 0.0 {
            TradeAction::Buy
        } else if ret < 0.0 {
            TradeAction::Sell
        } else {
            TradeAction::Hold
        }
    }
}

/// Warmup replays history with the realised outcome visible; test asks the
/// agent to choose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Warmup,
    #[default]
    Test,
}

/// How a decision came out of the guarded generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionStatus {
    /// Response matched the expected shape exactly.
    Validated,
    /// Response needed structural repair before it matched.
    Repaired,
    /// No usable response. The decision is a neutral placeholder and must not
    /// be read as a market signal.
    Failed { reason: String },
}

/// The agent's decision for one symbol on one day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: Uuid,
    pub symbol: String,
    pub day: Day,
    pub action: TradeAction,
    pub rationale: String,
    /// Cited prompt indices, grouped by the tier field they were cited under.
    pub citations: BTreeMap<Tier, Vec<MemoryIndex>>,
    pub status: DecisionStatus,
}

impl Decision {
    /// Neutral placeholder emitted when generation could not produce a decision.
    pub fn failed(symbol: &str, day: Day, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            day,
            action: TradeAction::Hold,
            rationale: String::new(),
            citations: BTreeMap::new(),
            status: DecisionStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DecisionStatus::Failed { .. })
    }

    pub fn cited_count(&self) -> usize {
        self.citations.values().map(Vec::len).sum()
    }
}

/// What happened to the reflection step on a given day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReflectionOutcome {
    NotScheduled,
    /// Scheduled, but there was nothing usable to reflect on.
    Skipped { reason: String },
    Stored { id: MemoryId },
    /// Rejected as a near-duplicate of an existing reflection.
    Duplicate,
}

/// Per symbol, per day record of one decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayReport {
    pub symbol: String,
    pub day: Day,
    pub date: NaiveDate,
    pub decision: Decision,
    /// Storage ids that were reinforced, resolved from the decision's citations.
    pub cited_memory_ids: BTreeMap<Tier, Vec<MemoryId>>,
    pub memories_added: usize,
    pub reflection: ReflectionOutcome,
    /// Realised next-day return, when known.
    pub realised_return: Option<f64>,
}
