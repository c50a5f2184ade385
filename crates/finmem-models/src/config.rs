use serde::{Deserialize, Serialize};

use crate::decision::RunMode;
use crate::memory::{Tier, TierPolicy};

/// Top-level configuration for a FinMem run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FinmemConfig {
    pub memory: MemoryConfig,
    pub retrieval: RetrievalConfig,
    pub generator: GeneratorConfig,
    pub embedding: EmbeddingConfig,
    pub simulation: SimulationConfig,
}

/// Memory engine parameters: global bounds plus one policy per tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Ceiling for every record's importance.
    pub importance_upper_bound: f64,
    /// Importance added each time a record is cited.
    pub importance_update_step: f64,
    pub short: TierPolicy,
    pub mid: TierPolicy,
    pub long: TierPolicy,
    pub reflection: TierPolicy,
    pub weights: ScoreWeights,
}

impl MemoryConfig {
    pub fn policy(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::Short => &self.short,
            Tier::Mid => &self.mid,
            Tier::Long => &self.long,
            Tier::Reflection => &self.reflection,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            importance_upper_bound: 100.0,
            importance_update_step: 18.0,
            short: TierPolicy::short_default(),
            mid: TierPolicy::mid_default(),
            long: TierPolicy::long_default(),
            reflection: TierPolicy::reflection_default(),
            weights: ScoreWeights::default(),
        }
    }
}

/// Weights of the three retrieval score components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub similarity: f64,
    pub recency: f64,
    pub importance: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            similarity: 1.0,
            recency: 1.0,
            importance: 1.0,
        }
    }
}

/// Per-tier retrieval budgets and the query used to search memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub short_top_k: usize,
    pub mid_top_k: usize,
    pub long_top_k: usize,
    pub reflection_top_k: usize,
    /// Investor profile text. Combined with the symbol it forms the
    /// retrieval query.
    pub character: String,
}

impl RetrievalConfig {
    pub fn top_k(&self, tier: Tier) -> usize {
        match tier {
            Tier::Short => self.short_top_k,
            Tier::Mid => self.mid_top_k,
            Tier::Long => self.long_top_k,
            Tier::Reflection => self.reflection_top_k,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            short_top_k: 5,
            mid_top_k: 5,
            long_top_k: 5,
            reflection_top_k: 5,
            character: "A seasoned stock market trader who weighs recent news, \
                        price momentum and company fundamentals."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorProvider {
    /// Shell out to the `claude` CLI.
    #[default]
    ClaudeCli,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    OpenAi,
}

/// Text generation service and the retry policy wrapped around it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub provider: GeneratorProvider,
    pub model: String,
    pub api_base: String,
    /// Environment variable holding the API key for HTTP providers.
    pub api_key_env: String,
    pub request_timeout_seconds: u64,
    /// Total attempts on transport errors, including the first.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Ask HTTP providers for a JSON object response.
    pub json_mode: bool,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: GeneratorProvider::ClaudeCli,
            model: "claude-3-5-haiku-latest".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_seconds: 60,
            max_attempts: 3,
            retry_delay_ms: 5_000,
            json_mode: true,
            temperature: 0.6,
            max_tokens: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Offline feature-hashing embedder.
    #[default]
    Hashing,
    /// Any OpenAI-compatible `/embeddings` endpoint.
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub api_base: String,
    pub api_key_env: String,
    /// Fixed vector length. Every stored and query embedding must match.
    pub dimensions: usize,
    pub timeout_seconds: u64,
    /// Maximum number of cached text embeddings.
    pub cache_capacity: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "text-embedding-3-small".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimensions: 256,
            timeout_seconds: 60,
            cache_capacity: 10_000,
        }
    }
}

/// When the reflection step runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReflectionSchedule {
    Never,
    EveryNDays { n: u32 },
    /// Reflect whenever the absolute momentum return reaches `threshold`.
    OnMomentum { threshold: f64 },
}

impl Default for ReflectionSchedule {
    fn default() -> Self {
        ReflectionSchedule::EveryNDays { n: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Symbols to trade. Empty means every symbol found in the data file.
    pub symbols: Vec<String>,
    pub mode: RunMode,
    /// Number of day-over-day returns summed into the momentum signal.
    pub momentum_window_size: usize,
    pub reflection: ReflectionSchedule,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            mode: RunMode::Test,
            momentum_window_size: 3,
            reflection: ReflectionSchedule::default(),
        }
    }
}
