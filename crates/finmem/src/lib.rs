//! FinMem - a trading agent with a layered, decaying memory.
//!
//! Each simulated trading day the agent retrieves its most relevant memories,
//! asks a text generation service for a cited decision, reinforces what it
//! cited, stores the day's observations and sweeps every memory tier.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use finmem::models::FinmemConfig;
//! use finmem::simulation::{load_observations, Simulation};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = FinmemConfig::default();
//! let engine = finmem::build_engine(&config)?;
//! let cycle = finmem::build_cycle(&config)?;
//! let mut simulation = Simulation::new(&config.simulation, "demo", cycle, engine);
//! let observations = load_observations("demos/observations.jsonl")?;
//! let summary = simulation.run(observations).await?;
//! println!("{}", serde_json::to_string_pretty(&summary)?);
//! # Ok(())
//! # }
//! ```

pub use finmem_agents as agents;
pub use finmem_memory as memory;
pub use finmem_models as models;

pub mod error;
pub mod simulation;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use finmem_agents::{
    Assembler, CachedEmbedder, ClaudeCliGenerator, DecisionCycle, Embedder, GuardPolicy,
    GuardedGenerator, HashingEmbedder, OpenAiChatGenerator, OpenAiEmbedder, TextGenerator,
};
use finmem_memory::MemoryEngine;
use finmem_models::{
    EmbeddingConfig, EmbeddingProvider, FinmemConfig, GeneratorConfig, GeneratorProvider,
};

/// Parse a TOML configuration. Missing sections and fields take defaults.
pub fn parse_config(text: &str) -> Result<FinmemConfig, anyhow::Error> {
    let config: FinmemConfig = toml::from_str(text).context("Failed to parse config")?;
    finmem_memory::validate_config(&config.memory, config.embedding.dimensions)
        .context("Invalid memory configuration")?;
    Ok(config)
}

/// Build the text generation backend named by the configuration.
pub fn build_generator(config: &GeneratorConfig) -> Result<Arc<dyn TextGenerator>, anyhow::Error> {
    let generator: Arc<dyn TextGenerator> = match config.provider {
        GeneratorProvider::ClaudeCli => Arc::new(ClaudeCliGenerator::new(config.model.clone())),
        GeneratorProvider::OpenAi => Arc::new(
            OpenAiChatGenerator::from_env(config).context("Failed to build chat generator")?,
        ),
    };
    Ok(generator)
}

/// Build the embedding backend, cached when `cache_capacity` is non-zero.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, anyhow::Error> {
    let inner: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(config.dimensions)),
        EmbeddingProvider::OpenAi => {
            Arc::new(OpenAiEmbedder::from_env(config).context("Failed to build embedder")?)
        }
    };
    if config.cache_capacity == 0 {
        return Ok(inner);
    }
    Ok(Arc::new(CachedEmbedder::new(inner, config.cache_capacity)))
}

/// Build an empty memory engine sized for the configured embeddings.
pub fn build_engine(config: &FinmemConfig) -> Result<MemoryEngine, anyhow::Error> {
    MemoryEngine::new(config.memory.clone(), config.embedding.dimensions)
        .context("Failed to build memory engine")
}

/// Build a decision cycle around explicit service backends.
pub fn build_cycle_with(
    config: &FinmemConfig,
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn Embedder>,
) -> Result<DecisionCycle, anyhow::Error> {
    if embedder.dimensions() != config.embedding.dimensions {
        anyhow::bail!(
            "embedder produces {} dimensions, memory expects {}",
            embedder.dimensions(),
            config.embedding.dimensions
        );
    }
    let mode = config.simulation.mode;
    let guarded = GuardedGenerator::new(
        generator,
        GuardPolicy::from_config(&config.generator),
        mode,
        config.retrieval.character.clone(),
    );
    Ok(DecisionCycle::new(
        Assembler::new(config.retrieval.clone(), mode),
        guarded,
        embedder,
        Arc::new(config.simulation.reflection.clone()),
    )
    .with_embed_timeout(Duration::from_secs(config.embedding.timeout_seconds)))
}

/// Build a decision cycle with the backends named by the configuration.
pub fn build_cycle(config: &FinmemConfig) -> Result<DecisionCycle, anyhow::Error> {
    build_cycle_with(
        config,
        build_generator(&config.generator)?,
        build_embedder(&config.embedding)?,
    )
}
