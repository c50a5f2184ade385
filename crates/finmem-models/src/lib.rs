pub mod config;
pub mod decision;
pub mod market;
pub mod memory;

pub use config::{
    EmbeddingConfig, EmbeddingProvider, FinmemConfig, GeneratorConfig, GeneratorProvider,
    MemoryConfig, ReflectionSchedule, RetrievalConfig, ScoreWeights, SimulationConfig,
};
pub use decision::{
    DayReport, Decision, DecisionStatus, MemoryIndex, ReflectionOutcome, RunMode, TradeAction,
};
pub use market::{DayInput, MarketObservation, Momentum, MomentumDirection};
pub use memory::{Day, MemoryId, MemoryRecord, Tier, TierPolicy};
