use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical day index within one simulation run.
pub type Day = u32;

/// The four ordered memory partitions kept for every traded symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Short,
    Mid,
    Long,
    Reflection,
}

impl Tier {
    /// All tiers in prompt / storage order.
    pub const ALL: [Tier; 4] = [Tier::Short, Tier::Mid, Tier::Long, Tier::Reflection];

    /// Tiers that take part in promotion and demotion, lowest first.
    pub const LADDER: [Tier; 3] = [Tier::Short, Tier::Mid, Tier::Long];

    /// The tier a record graduates into. Reflection never moves.
    pub fn up(self) -> Option<Tier> {
        match self {
            Tier::Short => Some(Tier::Mid),
            Tier::Mid => Some(Tier::Long),
            Tier::Long | Tier::Reflection => None,
        }
    }

    /// The tier a record falls back into. Reflection never moves.
    pub fn down(self) -> Option<Tier> {
        match self {
            Tier::Mid => Some(Tier::Short),
            Tier::Long => Some(Tier::Mid),
            Tier::Short | Tier::Reflection => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Short => "short",
            Tier::Mid => "mid",
            Tier::Long => "long",
            Tier::Reflection => "reflection",
        }
    }

    /// Field name used for this tier's citations in structured responses.
    pub fn citation_field(self) -> &'static str {
        match self {
            Tier::Short => "short_memory_ids",
            Tier::Mid => "mid_memory_ids",
            Tier::Long => "long_memory_ids",
            Tier::Reflection => "reflection_memory_ids",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage identifier, unique within one (symbol, tier) partition.
///
/// Ids are never reused inside a partition, and a record that moves between
/// tiers is given a fresh id by its destination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single textual observation held by exactly one tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub text: String,
    pub embedding: Vec<f32>,
    pub symbol: String,
    pub tier: Tier,
    /// Always within `[0, importance_upper_bound]`.
    pub importance: f64,
    pub created_at: Day,
    pub last_accessed_at: Day,
}

/// Decay, promotion and cleanup parameters for one tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierPolicy {
    pub importance_init: f64,
    /// Time constant (in days) of the recency factor `exp(-elapsed / factor)`.
    pub decay_recency_factor: f64,
    /// Multiplier applied to importance once per sweep. Must be in (0, 1].
    pub decay_importance_factor: f64,
    pub clean_up_recency_threshold: f64,
    pub clean_up_importance_threshold: f64,
    #[serde(default)]
    pub jump_upper_threshold: Option<f64>,
    #[serde(default)]
    pub jump_lower_threshold: Option<f64>,
    /// Only meaningful for the reflection tier: inserts whose nearest
    /// neighbour is at least this similar are rejected.
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
}

impl TierPolicy {
    pub fn short_default() -> Self {
        Self {
            importance_init: 50.0,
            decay_recency_factor: 3.0,
            decay_importance_factor: 0.92,
            clean_up_recency_threshold: 0.05,
            clean_up_importance_threshold: 5.0,
            jump_upper_threshold: Some(60.0),
            jump_lower_threshold: None,
            similarity_threshold: None,
        }
    }

    pub fn mid_default() -> Self {
        Self {
            importance_init: 65.0,
            decay_recency_factor: 90.0,
            decay_importance_factor: 0.967,
            clean_up_recency_threshold: 0.05,
            clean_up_importance_threshold: 5.0,
            jump_upper_threshold: Some(80.0),
            jump_lower_threshold: Some(40.0),
            similarity_threshold: None,
        }
    }

    pub fn long_default() -> Self {
        Self {
            importance_init: 85.0,
            decay_recency_factor: 365.0,
            decay_importance_factor: 0.988,
            clean_up_recency_threshold: 0.05,
            clean_up_importance_threshold: 5.0,
            jump_upper_threshold: None,
            jump_lower_threshold: Some(70.0),
            similarity_threshold: None,
        }
    }

    pub fn reflection_default() -> Self {
        Self {
            importance_init: 80.0,
            decay_recency_factor: 365.0,
            decay_importance_factor: 0.988,
            clean_up_recency_threshold: 0.05,
            clean_up_importance_threshold: 5.0,
            jump_upper_threshold: None,
            jump_lower_threshold: None,
            similarity_threshold: Some(0.95),
        }
    }

    /// Recency factor for a record last touched `elapsed` days ago.
    pub fn recency(&self, elapsed: Day) -> f64 {
        (-(f64::from(elapsed)) / self.decay_recency_factor).exp()
    }
}
